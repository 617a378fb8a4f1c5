//! The LSB script container: header, component parameter table and the
//! command list, plus line/label lookups over it.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;

use crate::codec::{pack_flags, unpack_flags, Reader, Writer};
use crate::command::{Command, CommandKind, LabelReference, LabelTarget};
use crate::novel::TpWord;
use crate::{check_version, LsbError, Result, DEFAULT_LSB_VERSION};

/// Order in which commands are scanned for text and menus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// As stored in the file.
    #[default]
    File,
    /// Approximate execution order (see [`Script::walk`]), with unreachable
    /// commands last.
    Run,
}

/// A `TextIns` command with the label that introduces it.
#[derive(Debug, Clone, Copy)]
pub struct Scenario<'a> {
    pub index: usize,
    pub line_no: u32,
    pub name: &'a str,
    pub text: &'a TpWord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Script {
    pub version: u32,
    pub flags: u8,
    /// `[command type][property slot]`; declares which fields component
    /// commands carry in this file.
    pub command_params: Vec<Vec<bool>>,
    pub commands: Vec<Command>,
    /// File name of this script, used to tell same-file jumps from
    /// jumps into other scripts.
    #[serde(skip)]
    pub call_name: String,
}

impl Script {
    /// Empty script at the default version.
    pub fn new(call_name: &str) -> Script {
        Script {
            version: DEFAULT_LSB_VERSION,
            flags: 0,
            command_params: Vec::new(),
            commands: Vec::new(),
            call_name: call_name.to_string(),
        }
    }

    pub fn parse(bytes: &[u8], call_name: &str) -> Result<Script> {
        let mut r = Reader::new(bytes);
        let version = r.u32()?;
        check_version(version)?;
        let flags = r.u8()?;
        let row_count = r.u32()? as usize;
        let row_size = r.u32()? as usize;
        let table_at = r.position();
        let table_len = row_count.checked_mul(row_size).ok_or(LsbError::Truncated {
            offset: table_at,
            needed: usize::MAX,
            remaining: r.remaining(),
        })?;
        let table = r.take(table_len)?;
        let command_params: Vec<Vec<bool>> = if row_size == 0 {
            vec![Vec::new(); row_count]
        } else {
            table.chunks(row_size).map(|row| unpack_flags(row, row_size * 8)).collect()
        };

        let count = r.count()?;
        let mut commands: Vec<Command> = Vec::with_capacity(count);
        for _ in 0..count {
            match Command::decode(&mut r, version, &command_params) {
                Ok(cmd) => commands.push(cmd),
                Err(e) => return Err(blame_previous_component(&commands, e)),
            }
        }

        if !r.is_empty() {
            let offset = r.position();
            let trailing = r.remaining();
            if let Some(last) = commands.last().filter(|c| c.kind.components().is_some()) {
                return Err(LsbError::MalformedCommand {
                    line: last.line_no,
                    reason: format!(
                        "{} bytes left after the last command; its parameter table row declares too few fields",
                        trailing
                    ),
                });
            }
            return Err(LsbError::TrailingData { offset, count: trailing });
        }

        debug!("parsed {} (version {}, {} commands)", call_name, version, commands.len());
        Ok(Script {
            version,
            flags,
            command_params,
            commands,
            call_name: call_name.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_version(self.version)?;
        let row_bits = self.command_params.first().map_or(0, Vec::len);
        if let Some(row) = self.command_params.iter().position(|r| r.len() != row_bits) {
            return Err(LsbError::Unsupported(format!(
                "parameter table row {} has {} flags, expected {}",
                row,
                self.command_params[row].len(),
                row_bits
            )));
        }
        // rows are stored as whole bytes with no bit count
        if row_bits % 8 != 0 {
            return Err(LsbError::Unsupported(format!(
                "parameter table rows have {} flags, not a multiple of 8",
                row_bits
            )));
        }

        let mut w = Writer::new();
        w.u32(self.version);
        w.u8(self.flags);
        w.count(self.command_params.len());
        w.count(row_bits.div_ceil(8));
        for row in &self.command_params {
            w.bytes(&pack_flags(row));
        }
        w.count(self.commands.len());
        for cmd in &self.commands {
            cmd.encode(&mut w, self.version, &self.command_params)?;
        }
        Ok(w.into_inner())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Label name to line number. The first label with a given name wins.
    pub fn label_index(&self) -> HashMap<String, u32> {
        let mut index = HashMap::new();
        for cmd in &self.commands {
            if let CommandKind::Label { name } = &cmd.kind {
                index.entry(name.clone()).or_insert(cmd.line_no);
            }
        }
        index
    }

    /// Line number to command index.
    pub fn line_map(&self) -> HashMap<u32, usize> {
        self.commands.iter().enumerate().map(|(i, c)| (c.line_no, i)).collect()
    }

    pub fn command_at_line(&self, line_no: u32) -> Option<(usize, &Command)> {
        self.commands.iter().enumerate().find(|(_, c)| c.line_no == line_no)
    }

    pub fn command_at_line_mut(&mut self, line_no: u32) -> Option<(usize, &mut Command)> {
        self.commands.iter_mut().enumerate().find(|(_, c)| c.line_no == line_no)
    }

    pub fn is_local(&self, target: &LabelReference) -> bool {
        target.page == self.call_name
    }

    /// Command index a same-file jump lands on. Label 0 is the top of the page.
    pub fn resolve_target(&self, target: &LabelReference, lines: &HashMap<u32, usize>) -> Option<usize> {
        if !self.is_local(target) {
            return None;
        }
        match target.label {
            LabelTarget::Line(0) if !lines.contains_key(&0) => (!self.commands.is_empty()).then_some(0),
            LabelTarget::Line(l) => lines.get(&l).copied(),
            LabelTarget::Name(_) => None,
        }
    }

    /// Replace symbolic same-file label targets with their line numbers.
    pub fn resolve_label_names(&mut self) -> Result<()> {
        let labels = self.label_index();
        let call_name = self.call_name.clone();
        for cmd in &mut self.commands {
            let line = cmd.line_no;
            let Some(target) = cmd.target_page_mut() else {
                continue;
            };
            if target.page != call_name {
                continue;
            }
            if let LabelTarget::Name(name) = &target.label {
                let resolved = if name.is_empty() {
                    0
                } else {
                    *labels.get(name).ok_or_else(|| LsbError::MalformedCommand {
                        line,
                        reason: format!("no label named '{}' in {}", name, call_name),
                    })?
                };
                target.label = LabelTarget::Line(resolved);
            }
        }
        Ok(())
    }

    /// Readable form of a jump target. Same-file targets are named from this
    /// script's labels; others go through `resolver`, which maps
    /// `(page, line)` to `(line, label name)`.
    pub fn describe_target(
        &self,
        target: &LabelReference,
        resolver: Option<&dyn Fn(&str, u32) -> Option<(u32, String)>>,
    ) -> String {
        let line = match &target.label {
            LabelTarget::Name(name) => return format!("{}:{}", target.page, name),
            LabelTarget::Line(l) => *l,
        };
        let name = if self.is_local(target) {
            self.command_at_line(line).and_then(|(_, c)| match &c.kind {
                CommandKind::Label { name } => Some(name.clone()),
                _ => None,
            })
        } else {
            resolver.and_then(|f| f(&target.page, line)).map(|(_, name)| name)
        };
        match name {
            Some(name) if !name.is_empty() => format!("{}:{}", target.page, name),
            _ => target.to_string(),
        }
    }

    /// Command indices in the requested order, each exactly once.
    pub fn indices(&self, order: Order) -> Vec<usize> {
        match order {
            Order::File => (0..self.commands.len()).collect(),
            Order::Run if self.commands.is_empty() => Vec::new(),
            Order::Run => self.walk(0, true).include_unreachable().map(|step| step.index).collect(),
        }
    }

    /// `TextIns` commands with the label that names them. The usual idiom is
    /// `Label` / `Calc` / `TextIns`; a label directly before the text also
    /// counts.
    pub fn text_scenarios(&self, order: Order) -> Vec<Scenario<'_>> {
        let mut out = Vec::new();
        for index in self.indices(order) {
            let cmd = &self.commands[index];
            if let CommandKind::TextIns(t) = &cmd.kind {
                out.push(Scenario {
                    index,
                    line_no: cmd.line_no,
                    name: self.scenario_name(index),
                    text: &t.text,
                });
            }
        }
        out
    }

    fn scenario_name(&self, index: usize) -> &str {
        let mut i = index;
        let mut skipped_calc = false;
        while i > 0 {
            i -= 1;
            match &self.commands[i].kind {
                CommandKind::Label { name } => return name,
                CommandKind::Calc { .. } if !skipped_calc => skipped_calc = true,
                _ => break,
            }
        }
        warn!(
            "{}: text on line {} has no scenario label",
            self.call_name, self.commands[index].line_no
        );
        ""
    }
}

/// A decode failure right after a component command usually means that
/// command's table row under-declared its fields and ate into the next one.
fn blame_previous_component(commands: &[Command], err: LsbError) -> LsbError {
    match commands.last() {
        Some(prev) if prev.kind.components().is_some() && !matches!(err, LsbError::MalformedCommand { .. }) => {
            LsbError::MalformedCommand {
                line: prev.line_no,
                reason: format!("next command failed to decode ({}); parameter table row may be wrong", err),
            }
        }
        _ => err,
    }
}
