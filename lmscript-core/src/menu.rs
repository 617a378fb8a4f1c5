//! Selection menu recognition.
//!
//! Menus are not declared anywhere in a script; they are recognised from the
//! command sequence the LiveNovel editor generates:
//!
//! ```text
//! Calc 選択実行中 = 1
//! Calc AddArray(_tmp, "choice")      (one per choice)
//! Calc 選択実行中 = 0                 (or a Trim/TrimArray of _tmp)
//! Jump page:label 選択値 == "choice" (one per choice, optionally a `1` default)
//! Wait
//! ```
//!
//! Preview-image menus call the preview menu script instead of building a
//! choice array, and take their buttons from a menu file read by the host.
//! Recognition is heuristic: anything that does not fit is a `NotAMenu`.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::codec::encode_cp932;
use crate::command::{CommandKind, LabelReference};
use crate::expr::{LiveParser, Param};
use crate::script::{Order, Script};
use crate::{LsbError, Result};

const SELECTING_ON: &str = "選択実行中 = 1";
const END_CALCS: [&str; 5] = [
    "選択実行中 = 0",
    "Trim(ArrayToString(_tmp))",
    "TrimArray(_tmp)",
    "_tmp = Trim(ArrayToString(_tmp))",
    "_tmp = TrimArray(_tmp)",
];
/// Script called to show a preview-image menu.
pub const PREVIEW_MENU_LSB: &str = r"ノベルシステム\プレビューメニュー\■選択実行.lsb";

fn choice_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^AddArray\(_tmp, "(?s:.*)"\)$"#).ok()).as_ref()
}

fn guard_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^選択値 == "(?s:.*)"$"#).ok()).as_ref()
}

/// Why a command sequence was not recognised as a menu.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotAMenu {
    #[error("command does not start a selection")]
    NoStart,
    #[error("no choices before the end of the selection")]
    NoChoices,
    #[error("no call to the preview menu script")]
    NoPreviewCall,
    #[error("menu file {0} has no buttons")]
    NoButtons(String),
    #[error("no choice jumps after the selection")]
    NoJumps,
    #[error("choice {0:?} has no matching jump")]
    UnmatchedChoice(String),
    #[error("choice {0:?} appears twice")]
    DuplicateChoice(String),
}

/// Host access to preview menu files.
pub trait PreviewMenuSource {
    /// `(image, button name)` pairs of the named menu file, or `None` if it
    /// cannot be read.
    fn buttons(&self, menu_file: &str) -> Option<Vec<(String, String)>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MenuKind {
    Text,
    Preview { menu_file: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuChoice {
    /// Displayed text, or the button image of a preview menu.
    pub text: String,
    orig_text: String,
    /// Button name of a preview menu choice.
    pub name: Option<String>,
    /// Index of the `AddArray` command holding the text.
    pub text_index: Option<usize>,
    pub target: LabelReference,
    /// Index of the jump taken for this choice.
    pub jump_index: usize,
}

impl MenuChoice {
    pub fn orig_text(&self) -> &str {
        &self.orig_text
    }

    pub fn is_modified(&self) -> bool {
        self.text != self.orig_text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionMenu {
    pub kind: MenuKind,
    /// Index and line of the command that starts the selection.
    pub index: usize,
    pub line_no: u32,
    pub label: Option<String>,
    pub choices: Vec<MenuChoice>,
}

impl SelectionMenu {
    /// Change the text of one choice. Only text menus can be edited.
    pub fn set_choice_text(&mut self, choice: usize, text: &str) -> Result<()> {
        if self.kind != MenuKind::Text {
            return Err(LsbError::Unsupported("preview menu choices are images".to_string()));
        }
        encode_cp932(text)?;
        let count = self.choices.len();
        let c = self.choices.get_mut(choice).ok_or_else(|| {
            LsbError::Unsupported(format!("menu on line {} has {} choices, not {}", self.line_no, count, choice + 1))
        })?;
        c.text = text.to_string();
        Ok(())
    }
}

/// Render for matching, treating unrenderable expressions as no match.
fn rendered(calc: &LiveParser) -> String {
    calc.render().unwrap_or_default()
}

/// The first string literal of an expression.
fn string_literal(calc: &LiveParser) -> Option<&str> {
    calc.entries
        .iter()
        .flat_map(|e| e.operands.iter())
        .find_map(|p| match p {
            Param::Str(s) => Some(s.as_str()),
            _ => None,
        })
}

fn replace_literal(calc: &mut LiveParser, from: &str, to: &str) -> bool {
    for entry in &mut calc.entries {
        for p in &mut entry.operands {
            if let Param::Str(s) = p {
                if s.as_str() == from {
                    *s = to.to_string();
                    return true;
                }
            }
        }
    }
    false
}

/// Jumps after a selection, keyed by the choice they test for; `None` is the
/// unconditional default.
type Jumps = HashMap<Option<String>, (LabelReference, usize)>;

impl Script {
    fn is_selection_start(&self, index: usize) -> bool {
        matches!(&self.commands[index].kind, CommandKind::Calc { calc } if rendered(calc) == SELECTING_ON)
    }

    fn menu_label(&self, start: usize) -> Option<String> {
        (1..=2).filter_map(|back| start.checked_sub(back)).find_map(|i| match &self.commands[i].kind {
            CommandKind::Label { name } => Some(name.clone()),
            _ => None,
        })
    }

    /// `AddArray` choices from `from` up to the end of the array; returns the
    /// choices and the index after the end.
    fn find_choices(&self, from: usize) -> (Vec<(String, usize)>, usize) {
        let mut choices = Vec::new();
        for i in from..self.commands.len() {
            let CommandKind::Calc { calc } = &self.commands[i].kind else {
                continue;
            };
            let text = rendered(calc);
            if END_CALCS.contains(&text.as_str()) {
                return (choices, i + 1);
            }
            if choice_re().is_some_and(|re| re.is_match(&text)) {
                if let Some(s) = string_literal(calc) {
                    choices.push((s.to_string(), i));
                }
            }
        }
        (choices, self.commands.len())
    }

    fn find_preview_call(&self, from: usize) -> Option<(&[LiveParser], usize)> {
        for i in from..self.commands.len() {
            match &self.commands[i].kind {
                CommandKind::Calc { calc } if rendered(calc) == END_CALCS[0] => return None,
                CommandKind::Call { page, params, .. } if page.page == PREVIEW_MENU_LSB => {
                    return Some((params.as_slice(), i + 1));
                }
                _ => {}
            }
        }
        None
    }

    /// Choice jumps at the indent of the first command after `from`, up to
    /// the next `Wait`.
    fn find_jumps(&self, from: usize) -> Jumps {
        let mut jumps = Jumps::new();
        let Some(first) = self.commands.get(from) else {
            return jumps;
        };
        let indent = first.indent;
        for (i, cmd) in self.commands.iter().enumerate().skip(from) {
            if cmd.indent > indent {
                continue;
            }
            match &cmd.kind {
                CommandKind::Wait { .. } => break,
                CommandKind::Jump { page, calc } => {
                    let text = rendered(calc);
                    if text == "1" {
                        jumps.insert(None, (page.clone(), i));
                    } else if guard_re().is_some_and(|re| re.is_match(&text)) {
                        if let Some(s) = string_literal(calc) {
                            jumps.insert(Some(s.to_string()), (page.clone(), i));
                        }
                    }
                }
                _ => {}
            }
        }
        jumps
    }

    /// Where a same-file choice jump ends up: a label followed directly by a
    /// jump or call into another script resolves to that script.
    fn resolve_choice_target(&self, target: &LabelReference, lines: &HashMap<u32, usize>) -> LabelReference {
        let Some(at) = self.resolve_target(target, lines) else {
            return target.clone();
        };
        for cmd in self.commands.iter().skip(at + 1) {
            match &cmd.kind {
                CommandKind::Jump { page, .. } | CommandKind::Call { page, .. } => {
                    if !self.is_local(page) {
                        return page.clone();
                    }
                    if matches!(cmd.kind, CommandKind::Jump { .. }) {
                        break;
                    }
                }
                _ => break,
            }
        }
        target.clone()
    }

    fn resolved_jumps(&self, from: usize) -> std::result::Result<Jumps, NotAMenu> {
        let mut jumps = self.find_jumps(from);
        if jumps.is_empty() {
            debug!("{}: no choice jumps after command {}", self.call_name, from);
            return Err(NotAMenu::NoJumps);
        }
        let lines = self.line_map();
        for (target, _) in jumps.values_mut() {
            *target = self.resolve_choice_target(target, &lines);
        }
        Ok(jumps)
    }

    fn text_menu(&self, start: usize) -> std::result::Result<SelectionMenu, NotAMenu> {
        let (choices, next) = self.find_choices(start + 1);
        if choices.is_empty() {
            return Err(NotAMenu::NoChoices);
        }
        let jumps = self.resolved_jumps(next)?;
        let mut out: Vec<MenuChoice> = Vec::with_capacity(choices.len());
        for (text, text_index) in choices {
            if out.iter().any(|c| c.text == text) {
                return Err(NotAMenu::DuplicateChoice(text));
            }
            let (target, jump_index) = match jumps.get(&Some(text.clone())) {
                Some(j) => j.clone(),
                None => match jumps.get(&None) {
                    Some(j) => {
                        info!("{}: choice {:?} uses the default jump", self.call_name, text);
                        j.clone()
                    }
                    None => return Err(NotAMenu::UnmatchedChoice(text)),
                },
            };
            out.push(MenuChoice {
                orig_text: text.clone(),
                text,
                name: None,
                text_index: Some(text_index),
                target,
                jump_index,
            });
        }
        Ok(SelectionMenu {
            kind: MenuKind::Text,
            index: start,
            line_no: self.commands[start].line_no,
            label: self.menu_label(start),
            choices: out,
        })
    }

    fn preview_menu(&self, start: usize, source: &dyn PreviewMenuSource) -> std::result::Result<SelectionMenu, NotAMenu> {
        let (params, next) = self.find_preview_call(start + 1).ok_or(NotAMenu::NoPreviewCall)?;
        let menu_file = match params.get(1).and_then(LiveParser::literal) {
            Some(Param::Str(s)) => s,
            _ => params.get(1).map(rendered).unwrap_or_default().trim_matches('"').to_string(),
        };
        let buttons = source.buttons(&menu_file).unwrap_or_default();
        if buttons.is_empty() {
            return Err(NotAMenu::NoButtons(menu_file));
        }
        let jumps = self.resolved_jumps(next)?;
        let mut out: Vec<MenuChoice> = Vec::new();
        for (image, name) in buttons {
            if out.iter().any(|c| c.name.as_deref() == Some(name.as_str())) {
                return Err(NotAMenu::DuplicateChoice(name));
            }
            let Some((target, jump_index)) = jumps.get(&Some(name.clone())).cloned() else {
                warn!("{}: {} has unreachable choice {:?}", self.call_name, menu_file, name);
                continue;
            };
            out.push(MenuChoice {
                orig_text: image.clone(),
                text: image,
                name: Some(name),
                text_index: None,
                target,
                jump_index,
            });
        }
        Ok(SelectionMenu {
            kind: MenuKind::Preview { menu_file },
            index: start,
            line_no: self.commands[start].line_no,
            label: self.menu_label(start),
            choices: out,
        })
    }

    /// Recognise the menu starting at command `index`. Preview-image menus
    /// are only recognised when `preview` is given.
    pub fn selection_menu(
        &self,
        index: usize,
        preview: Option<&dyn PreviewMenuSource>,
    ) -> std::result::Result<SelectionMenu, NotAMenu> {
        if index >= self.commands.len() || !self.is_selection_start(index) {
            return Err(NotAMenu::NoStart);
        }
        debug!("{}: looking for a menu at line {}", self.call_name, self.commands[index].line_no);
        let text_err = match self.text_menu(index) {
            Ok(menu) => return Ok(menu),
            Err(e) => e,
        };
        match preview.map(|source| self.preview_menu(index, source)) {
            Some(Ok(menu)) => Ok(menu),
            Some(Err(NotAMenu::NoPreviewCall)) | None => Err(text_err),
            Some(Err(e)) => Err(e),
        }
    }

    /// Text menus in the requested order.
    pub fn selection_menus(&self, order: Order) -> Vec<SelectionMenu> {
        self.selection_menus_with(order, None)
    }

    pub fn selection_menus_with(&self, order: Order, preview: Option<&dyn PreviewMenuSource>) -> Vec<SelectionMenu> {
        let mut menus = Vec::new();
        for index in self.indices(order) {
            if !self.is_selection_start(index) {
                continue;
            }
            match self.selection_menu(index, preview) {
                Ok(menu) => menus.push(menu),
                Err(e) => debug!("{}: line {} is not a menu: {}", self.call_name, self.commands[index].line_no, e),
            }
        }
        menus
    }

    /// Write edited choice text back into the `AddArray` calls and the jump
    /// guards testing for it. Saved choices take their new text as original,
    /// so the menu stays in step with the script.
    pub fn save_menu_choices(&mut self, menu: &mut SelectionMenu) -> Result<()> {
        if menu.kind != MenuKind::Text {
            return Err(LsbError::Unsupported("preview menu choices cannot be rewritten".to_string()));
        }
        for choice in menu.choices.iter_mut().filter(|c| c.is_modified()) {
            let text_index = choice.text_index.ok_or_else(|| LsbError::Unsupported("menu choice has no text command".to_string()))?;
            self.patch_literal(text_index, &choice.orig_text, &choice.text)?;
            let guard_is_default = match self.commands.get(choice.jump_index).map(|c| &c.kind) {
                Some(CommandKind::Jump { calc, .. }) => rendered(calc) == "1",
                _ => false,
            };
            if !guard_is_default {
                self.patch_literal(choice.jump_index, &choice.orig_text, &choice.text)?;
            }
            info!("{}: menu choice {:?} -> {:?}", self.call_name, choice.orig_text, choice.text);
            choice.orig_text = choice.text.clone();
        }
        Ok(())
    }

    fn patch_literal(&mut self, index: usize, from: &str, to: &str) -> Result<()> {
        let Some(cmd) = self.commands.get_mut(index) else {
            return Err(LsbError::Unsupported(format!("menu command #{} does not exist", index)));
        };
        let line = cmd.line_no;
        let patched = match &mut cmd.kind {
            CommandKind::Calc { calc } | CommandKind::Jump { calc, .. } => replace_literal(calc, from, to),
            _ => false,
        };
        if patched {
            Ok(())
        } else {
            Err(LsbError::MalformedCommand {
                line,
                reason: format!("no menu text {:?} to replace", from),
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{MenuKind, NotAMenu, PreviewMenuSource, PREVIEW_MENU_LSB};
    use crate::command::{Command, CommandKind, LabelReference};
    use crate::expr::{LiveParser, OpeData, OpeDataType, OpeFunc, Param, ARG_NAME};
    use crate::script::tests::{calc, jump, label, script, PAGE};
    use crate::script::{Order, Script};
    use crate::LsbError;

    fn var(name: &str) -> Param {
        Param::Var(name.to_string())
    }

    fn calc_cmd(line: u32, calc: LiveParser) -> Command {
        Command::new(line, 0, CommandKind::Calc { calc })
    }

    pub(crate) fn selecting(line: u32, on: bool) -> Command {
        calc_cmd(line, calc("選択実行中", Param::from(on)))
    }

    pub(crate) fn add_choice(line: u32, text: &str) -> Command {
        calc_cmd(
            line,
            LiveParser::new(vec![
                OpeData::new(OpeDataType::To, "____0", vec![Param::from(text)]),
                OpeData::call(OpeFunc::ADD_ARRAY, "____1", vec![var("_tmp"), var("____0")]),
                OpeData::new(OpeDataType::To, ARG_NAME, vec![var("____1")]),
            ]),
        )
    }

    fn guard(text: &str) -> LiveParser {
        LiveParser::new(vec![
            OpeData::new(OpeDataType::Equal, "____0", vec![var("選択値"), Param::from(text)]),
            OpeData::new(OpeDataType::To, ARG_NAME, vec![var("____0")]),
        ])
    }

    fn always() -> LiveParser {
        LiveParser::from_value(Param::Flag(1))
    }

    fn wait(line: u32) -> Command {
        Command::new(
            line,
            0,
            CommandKind::Wait {
                calc: always(),
                time: LiveParser::default(),
                stop_event: Some(LiveParser::default()),
            },
        )
    }

    /// Two-choice menu: "はい" goes through a local label to another
    /// script, "いいえ" stays local.
    pub(crate) fn menu_script() -> Script {
        script(vec![
            label(1, 0, "choice"),
            selecting(2, true),
            add_choice(3, "はい"),
            add_choice(4, "いいえ"),
            selecting(5, false),
            jump(6, 0, PAGE, 20, guard("はい")),
            jump(7, 0, PAGE, 30, guard("いいえ")),
            wait(8),
            label(20, 0, "yes"),
            jump(21, 0, "00000009.lsb", 5, always()),
            label(30, 0, "no"),
            calc_cmd(31, calc("x", Param::Int(1))),
        ])
    }

    #[test]
    fn recognises_text_menu() {
        let s = menu_script();
        let menu = s.selection_menu(1, None).unwrap();
        assert_eq!(menu.kind, MenuKind::Text);
        assert_eq!(menu.line_no, 2);
        assert_eq!(menu.label.as_deref(), Some("choice"));
        let found: Vec<(&str, String, usize)> = menu
            .choices
            .iter()
            .map(|c| (c.text.as_str(), c.target.to_string(), c.jump_index))
            .collect();
        assert_eq!(
            found,
            vec![
                ("はい", "00000009.lsb:5".to_string(), 5),
                ("いいえ", format!("{}:30", PAGE), 6),
            ]
        );
        assert_eq!(s.selection_menus(Order::File).len(), 1);
        assert_eq!(s.selection_menus(Order::Run).len(), 1);
    }

    #[test]
    fn choice_without_jump_is_not_a_menu() {
        let s = script(vec![
            selecting(1, true),
            add_choice(2, "a"),
            add_choice(3, "b"),
            add_choice(4, "c"),
            selecting(5, false),
            jump(6, 0, PAGE, 10, guard("a")),
            jump(7, 0, PAGE, 10, guard("b")),
            wait(8),
            label(10, 0, "end"),
        ]);
        assert_eq!(s.selection_menu(0, None), Err(NotAMenu::UnmatchedChoice("c".to_string())));
        assert!(s.selection_menus(Order::File).is_empty());
    }

    #[test]
    fn default_jump_catches_remaining_choices() {
        let s = script(vec![
            selecting(1, true),
            add_choice(2, "a"),
            add_choice(3, "b"),
            selecting(4, false),
            jump(5, 0, PAGE, 10, guard("a")),
            jump(6, 0, PAGE, 11, always()),
            wait(7),
            label(10, 0, "a"),
            label(11, 0, "rest"),
        ]);
        let menu = s.selection_menu(0, None).unwrap();
        assert_eq!(menu.choices[0].jump_index, 4);
        assert_eq!(menu.choices[1].jump_index, 5);
        assert_eq!(menu.choices[1].target, LabelReference::new(PAGE, 11));
    }

    #[test]
    fn partial_idioms_are_rejected() {
        let s = script(vec![selecting(1, true), add_choice(2, "a"), selecting(3, false), wait(4)]);
        assert_eq!(s.selection_menu(0, None), Err(NotAMenu::NoJumps));
        assert_eq!(s.selection_menu(1, None), Err(NotAMenu::NoStart));
        assert_eq!(s.selection_menu(9, None), Err(NotAMenu::NoStart));

        let s = script(vec![selecting(1, true), selecting(2, false), wait(3)]);
        assert_eq!(s.selection_menu(0, None), Err(NotAMenu::NoChoices));
    }

    #[test]
    fn deeper_jumps_are_skipped() {
        let mut s = menu_script();
        s.commands.insert(6, jump(50, 1, PAGE, 30, guard("はい")));
        let menu = s.selection_menu(1, None).unwrap();
        assert_eq!(menu.choices[0].jump_index, 5);
    }

    #[test]
    fn edited_choices_rewrite_array_and_guard() {
        let mut s = menu_script();
        let mut menu = s.selection_menu(1, None).unwrap();
        menu.set_choice_text(0, "Yes").unwrap();
        assert!(matches!(menu.set_choice_text(0, "한"), Err(LsbError::Encoding { ch: '한' })));
        assert!(menu.set_choice_text(5, "x").is_err());
        s.save_menu_choices(&mut menu).unwrap();
        assert!(!menu.choices[0].is_modified());
        assert_eq!(menu.choices[0].orig_text(), "Yes");

        let rendered = |s: &Script, i: usize| s.commands[i].kind.calc().unwrap().render().unwrap();
        assert_eq!(rendered(&s, 2), "AddArray(_tmp, \"Yes\")");
        assert_eq!(rendered(&s, 5), "選択値 == \"Yes\"");
        assert_eq!(rendered(&s, 3), "AddArray(_tmp, \"いいえ\")");
        assert_eq!(s.selection_menu(1, None).unwrap().choices[0].text, "Yes");

        // saving the same menu again keeps working from the saved text
        s.save_menu_choices(&mut menu).unwrap();
        menu.set_choice_text(0, "Sure").unwrap();
        s.save_menu_choices(&mut menu).unwrap();
        assert_eq!(rendered(&s, 2), "AddArray(_tmp, \"Sure\")");
        assert_eq!(rendered(&s, 5), "選択値 == \"Sure\"");
    }

    struct Buttons;

    impl PreviewMenuSource for Buttons {
        fn buttons(&self, menu_file: &str) -> Option<Vec<(String, String)>> {
            (menu_file == "menu\\main.lpm").then(|| {
                vec![
                    ("a.png".to_string(), "A".to_string()),
                    ("b.png".to_string(), "B".to_string()),
                    ("c.png".to_string(), "C".to_string()),
                ]
            })
        }
    }

    fn preview_script() -> Script {
        let mut params = vec![LiveParser::from_value(Param::from("")); 11];
        params[1] = LiveParser::from_value(Param::from("menu\\main.lpm"));
        script(vec![
            selecting(1, true),
            Command::new(
                2,
                0,
                CommandKind::Call {
                    page: LabelReference::new(PREVIEW_MENU_LSB, 0),
                    result: String::new(),
                    calc: always(),
                    params,
                },
            ),
            jump(3, 0, "00000002.lsb", 0, guard("A")),
            jump(4, 0, "00000003.lsb", 0, guard("B")),
            wait(5),
        ])
    }

    #[test]
    fn recognises_preview_menu_with_host_buttons() {
        let s = preview_script();
        assert_eq!(s.selection_menu(0, None), Err(NotAMenu::NoChoices));
        let menu = s.selection_menu(0, Some(&Buttons)).unwrap();
        assert_eq!(
            menu.kind,
            MenuKind::Preview {
                menu_file: "menu\\main.lpm".to_string()
            }
        );
        let names: Vec<(&str, Option<&str>)> =
            menu.choices.iter().map(|c| (c.text.as_str(), c.name.as_deref())).collect();
        assert_eq!(names, vec![("a.png", Some("A")), ("b.png", Some("B"))]);
        assert_eq!(s.selection_menus_with(Order::File, Some(&Buttons)).len(), 1);

        let mut menu = menu;
        assert!(matches!(menu.set_choice_text(0, "x"), Err(LsbError::Unsupported(_))));
    }
}
