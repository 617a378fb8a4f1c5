//! Static control flow over a script's command list.
//!
//! Guards are never evaluated. A guard that renders as `"0"` is never taken,
//! `"1"` is always taken and anything else may go either way. Jumps into
//! other scripts are not followed.

use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write;

use crate::command::{Command, CommandKind};
use crate::expr::LiveParser;
use crate::script::Script;

/// One command reached by [`Script::walk`].
#[derive(Debug, Clone)]
pub struct WalkStep<'a> {
    pub index: usize,
    pub command: &'a Command,
    /// Last conditional guard on the path that reached this command.
    pub guard: Option<String>,
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEdge {
    pub from: usize,
    pub to: usize,
    pub label: Option<String>,
}

#[derive(Debug)]
struct Successor {
    to: usize,
    label: Option<String>,
    /// Guard that holds on this edge; `None` keeps the incoming one.
    guard: Option<String>,
}

impl Successor {
    fn plain(to: usize) -> Successor {
        Successor {
            to,
            label: None,
            guard: None,
        }
    }

    fn branch(to: usize, label: String, guard: Option<String>) -> Successor {
        Successor {
            to,
            label: Some(label),
            guard,
        }
    }
}

enum Taken {
    Never,
    Always,
    Maybe(String),
}

fn taken(calc: &LiveParser) -> Taken {
    let text = calc.render().unwrap_or_else(|e| {
        warn!("guard could not be rendered: {}", e);
        String::new()
    });
    match text.as_str() {
        "0" => Taken::Never,
        "1" => Taken::Always,
        _ => Taken::Maybe(text),
    }
}

/// Breadth-first traversal from a start command. See [`Script::walk`].
pub struct Walk<'a> {
    script: &'a Script,
    lines: HashMap<u32, usize>,
    queue: VecDeque<(usize, Option<String>)>,
    visited: Vec<bool>,
    follow: bool,
    unreachable: bool,
    residual: Option<VecDeque<usize>>,
}

impl<'a> Walk<'a> {
    /// Also yield every command the traversal never reached, in file order,
    /// once the reachable ones are exhausted.
    pub fn include_unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }
}

impl<'a> Iterator for Walk<'a> {
    type Item = WalkStep<'a>;

    fn next(&mut self) -> Option<WalkStep<'a>> {
        let script: &'a Script = self.script;
        let commands = &script.commands;
        if let Some((pc, guard)) = self.queue.pop_front() {
            let succ = if self.follow {
                script.successors(pc, &self.lines)
            } else {
                (pc + 1 < commands.len())
                    .then(|| Successor::plain(pc + 1))
                    .into_iter()
                    .collect()
            };
            for s in succ {
                if !self.visited[s.to] {
                    self.visited[s.to] = true;
                    self.queue.push_back((s.to, s.guard.or_else(|| guard.clone())));
                }
            }
            return Some(WalkStep {
                index: pc,
                command: &commands[pc],
                guard,
                reachable: true,
            });
        }
        if !self.unreachable {
            return None;
        }
        let visited = &self.visited;
        let residual = self.residual.get_or_insert_with(|| {
            let rest: VecDeque<usize> = (0..visited.len()).filter(|i| !visited[*i]).collect();
            if !rest.is_empty() {
                info!("file contains {} unreachable commands", rest.len());
            }
            rest
        });
        let pc = residual.pop_front()?;
        Some(WalkStep {
            index: pc,
            command: &commands[pc],
            guard: None,
            reachable: false,
        })
    }
}

impl Script {
    /// Commands in approximate execution order, starting at index `start`.
    ///
    /// Each command is yielded at most once. With `follow_internal_branches`
    /// set, same-file jumps, `If` chains and `While` loops are followed (a
    /// taken branch before the fall-through); otherwise commands are visited
    /// in file order.
    pub fn walk(&self, start: usize, follow_internal_branches: bool) -> Walk<'_> {
        let mut visited = vec![false; self.commands.len()];
        let mut queue = VecDeque::new();
        if start < self.commands.len() {
            visited[start] = true;
            queue.push_back((start, None));
        }
        Walk {
            script: self,
            lines: self.line_map(),
            queue,
            visited,
            follow: follow_internal_branches,
            unreachable: false,
            residual: None,
        }
    }

    /// Every control-flow edge, labelled where a branch is conditional.
    pub fn flow_edges(&self) -> Vec<FlowEdge> {
        let lines = self.line_map();
        let mut edges = Vec::new();
        for pc in 0..self.commands.len() {
            for s in self.successors(pc, &lines) {
                edges.push(FlowEdge {
                    from: pc,
                    to: s.to,
                    label: s.label,
                });
            }
        }
        edges
    }

    /// The control-flow graph in Graphviz DOT form, one node per command.
    pub fn flow_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", dot_escape(&self.call_name));
        let _ = writeln!(out, "  node [shape=box, fontname=\"monospace\"];");
        for (i, cmd) in self.commands.iter().enumerate() {
            let _ = writeln!(out, "  n{} [label=\"{}\\l\"];", i, dot_escape(cmd.to_string().trim()));
        }
        for edge in self.flow_edges() {
            match &edge.label {
                Some(label) => {
                    let _ = writeln!(out, "  n{} -> n{} [label=\"{}\"];", edge.from, edge.to, dot_escape(label));
                }
                None => {
                    let _ = writeln!(out, "  n{} -> n{};", edge.from, edge.to);
                }
            }
        }
        out.push_str("}\n");
        out
    }

    fn successors(&self, pc: usize, lines: &HashMap<u32, usize>) -> Vec<Successor> {
        let cmds = &self.commands;
        let cmd = &cmds[pc];
        let next = (pc + 1 < cmds.len()).then_some(pc + 1);
        let fall = || next.map(Successor::plain).into_iter().collect::<Vec<_>>();
        if cmd.mute {
            return fall();
        }
        match &cmd.kind {
            CommandKind::Jump { page, calc } => {
                if !self.is_local(page) {
                    return match taken(calc) {
                        Taken::Always => Vec::new(),
                        _ => fall(),
                    };
                }
                let Some(target) = self.resolve_target(page, lines) else {
                    warn!("{}: jump on line {} to missing {}", self.call_name, cmd.line_no, page);
                    return fall();
                };
                match taken(calc) {
                    Taken::Never => fall(),
                    Taken::Always => vec![Successor::plain(target)],
                    Taken::Maybe(c) => {
                        let mut out = vec![Successor::branch(target, format!("If {}", c), Some(c))];
                        out.extend(next.map(|n| Successor::branch(n, "Else".to_string(), None)));
                        out
                    }
                }
            }
            CommandKind::If { .. } => self.if_successors(pc),
            CommandKind::Elseif { .. } | CommandKind::Else => {
                self.chain_end(pc).map(Successor::plain).into_iter().collect()
            }
            CommandKind::While { calc, .. } => {
                let exit = self.matching_loop_end(pc).and_then(|l| (l + 1 < cmds.len()).then_some(l + 1));
                match taken(calc) {
                    Taken::Never => exit.map(Successor::plain).into_iter().collect(),
                    Taken::Always => fall(),
                    Taken::Maybe(c) => {
                        let mut out: Vec<Successor> = next
                            .map(|n| Successor::branch(n, format!("While {}", c), Some(c)))
                            .into_iter()
                            .collect();
                        out.extend(exit.map(|e| Successor::branch(e, "Done".to_string(), None)));
                        out
                    }
                }
            }
            CommandKind::WhileLoop { .. } => match self.enclosing_while(pc, cmd.indent, true) {
                Some(w) => vec![Successor::plain(w)],
                None => fall(),
            },
            CommandKind::Break { calc, .. } => {
                let exit = self
                    .enclosing_loop_end(pc)
                    .and_then(|l| (l + 1 < cmds.len()).then_some(l + 1));
                self.jump_like(calc, exit, next, "Break")
            }
            CommandKind::Continue { calc, .. } => {
                let target = self.enclosing_while(pc, cmd.indent, false);
                self.jump_like(calc, target, next, "Continue")
            }
            CommandKind::Exit { calc } => match taken(calc) {
                Taken::Always => Vec::new(),
                _ => fall(),
            },
            CommandKind::Terminate
            | CommandKind::PcReset { .. }
            | CommandKind::Reset { .. }
            | CommandKind::GameLoad { .. } => Vec::new(),
            _ => fall(),
        }
    }

    fn jump_like(
        &self,
        calc: &LiveParser,
        target: Option<usize>,
        next: Option<usize>,
        what: &str,
    ) -> Vec<Successor> {
        let fall = next.map(Successor::plain).into_iter().collect::<Vec<_>>();
        let Some(target) = target else {
            return fall;
        };
        match taken(calc) {
            Taken::Never => fall,
            Taken::Always => vec![Successor::plain(target)],
            Taken::Maybe(c) => {
                let mut out = vec![Successor::branch(target, format!("{} {}", what, c), Some(c))];
                out.extend(next.map(Successor::plain));
                out
            }
        }
    }

    /// Cases of the `If` chain starting at `pc` and the index after it.
    fn if_chain(&self, pc: usize) -> (Vec<usize>, Option<usize>) {
        let indent = self.commands[pc].indent;
        let mut cases = vec![pc];
        for (i, cmd) in self.commands.iter().enumerate().skip(pc + 1) {
            if cmd.indent > indent {
                continue;
            }
            if cmd.indent == indent && matches!(cmd.kind, CommandKind::Elseif { .. } | CommandKind::Else) {
                let is_else = matches!(cmd.kind, CommandKind::Else);
                cases.push(i);
                if is_else {
                    return (cases, self.after_block(i));
                }
                continue;
            }
            return (cases, Some(i));
        }
        (cases, None)
    }

    fn if_successors(&self, pc: usize) -> Vec<Successor> {
        let (cases, end) = self.if_chain(pc);
        let mut out = Vec::new();
        let mut has_else = false;
        for case in cases {
            let (label, guard) = match &self.commands[case].kind {
                CommandKind::If { calc } | CommandKind::Elseif { calc } => match taken(calc) {
                    Taken::Never => continue,
                    Taken::Always => (self.commands[case].command_type().name().to_string(), None),
                    Taken::Maybe(c) => (format!("{} {}", self.commands[case].command_type().name(), c), Some(c)),
                },
                _ => {
                    has_else = true;
                    ("Else".to_string(), None)
                }
            };
            let body = case + 1;
            let target = if body < self.commands.len() && self.commands[body].indent > self.commands[case].indent {
                Some(body)
            } else {
                end
            };
            if let Some(t) = target {
                out.push(Successor::branch(t, label, guard));
            }
        }
        if !has_else {
            if let Some(end) = end {
                out.push(Successor::branch(end, "Else".to_string(), None));
            }
        }
        out
    }

    /// First command after the branch body of the case at `pc`.
    fn after_block(&self, pc: usize) -> Option<usize> {
        let indent = self.commands[pc].indent;
        (pc + 1..self.commands.len()).find(|i| self.commands[*i].indent <= indent)
    }

    /// Where control goes after falling into an `Elseif`/`Else` case header.
    fn chain_end(&self, pc: usize) -> Option<usize> {
        let indent = self.commands[pc].indent;
        let mut i = pc;
        loop {
            i = self.after_block(i)?;
            let cmd = &self.commands[i];
            let chained = cmd.indent == indent && matches!(cmd.kind, CommandKind::Elseif { .. } | CommandKind::Else);
            if !chained {
                return Some(i);
            }
        }
    }

    /// The `WhileLoop` closing the `While` at `pc`.
    fn matching_loop_end(&self, pc: usize) -> Option<usize> {
        let indent = self.commands[pc].indent;
        let end = self.after_block(pc)?;
        let cmd = &self.commands[end];
        (cmd.indent == indent && matches!(cmd.kind, CommandKind::WhileLoop { .. })).then_some(end)
    }

    /// The `WhileLoop` of the innermost loop containing `pc`.
    fn enclosing_loop_end(&self, pc: usize) -> Option<usize> {
        let indent = self.commands[pc].indent;
        (pc + 1..self.commands.len()).find(|i| {
            let cmd = &self.commands[*i];
            cmd.indent < indent && matches!(cmd.kind, CommandKind::WhileLoop { .. })
        })
    }

    /// The `While` a loop increment (`same_level`) or a `Continue` inside the
    /// body returns to.
    fn enclosing_while(&self, pc: usize, indent: u32, same_level: bool) -> Option<usize> {
        (0..pc).rev().find(|i| {
            let cmd = &self.commands[*i];
            let level = if same_level {
                cmd.indent == indent
            } else {
                cmd.indent < indent
            };
            level && matches!(cmd.kind, CommandKind::While { .. })
        })
    }
}

fn dot_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}
