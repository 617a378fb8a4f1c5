//! Translation interchange: stable identifiers for translatable text, the
//! units exchanged with translators, and applying them back to a script.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::encode_cp932;
use crate::command::CommandKind;
use crate::menu::{MenuKind, PreviewMenuSource};
use crate::script::{Order, Script};
use crate::{LsbError, Result};

const PREFIX: &str = "pylm";

/// Where a translatable string lives: file, command line and the index of
/// the block or choice inside that command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextIdentifier {
    Text { file: String, line: u32, block: usize },
    MenuText { file: String, line: u32, choice: usize },
    MenuLpm { file: String, line: u32, choice: usize },
}

impl TextIdentifier {
    fn kind(&self) -> &'static str {
        match self {
            TextIdentifier::Text { .. } => "text",
            TextIdentifier::MenuText { .. } => "menu-text",
            TextIdentifier::MenuLpm { .. } => "menu-lpm",
        }
    }

    pub fn file(&self) -> &str {
        match self {
            TextIdentifier::Text { file, .. }
            | TextIdentifier::MenuText { file, .. }
            | TextIdentifier::MenuLpm { file, .. } => file,
        }
    }

    pub fn line(&self) -> u32 {
        match self {
            TextIdentifier::Text { line, .. }
            | TextIdentifier::MenuText { line, .. }
            | TextIdentifier::MenuLpm { line, .. } => *line,
        }
    }

    /// Block or choice index.
    pub fn index(&self) -> usize {
        match self {
            TextIdentifier::Text { block, .. } => *block,
            TextIdentifier::MenuText { choice, .. } | TextIdentifier::MenuLpm { choice, .. } => *choice,
        }
    }
}

impl fmt::Display for TextIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}:{}", PREFIX, self.kind(), self.file(), self.line(), self.index())
    }
}

impl FromStr for TextIdentifier {
    type Err = LsbError;

    /// File names may contain `:`, so the numeric fields are taken from the
    /// right.
    fn from_str(s: &str) -> Result<TextIdentifier> {
        let bad = || LsbError::BadIdentifier(s.to_string());
        let rest = s.strip_prefix(PREFIX).and_then(|r| r.strip_prefix(':')).ok_or_else(bad)?;
        let (kind, rest) = rest.split_once(':').ok_or_else(bad)?;
        let mut fields = rest.rsplitn(3, ':');
        let index: usize = fields.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
        let line: u32 = fields.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
        let file = fields.next().filter(|f| !f.is_empty()).ok_or_else(bad)?.to_string();
        match kind {
            "text" => Ok(TextIdentifier::Text { file, line, block: index }),
            "menu-text" => Ok(TextIdentifier::MenuText { file, line, choice: index }),
            "menu-lpm" => Ok(TextIdentifier::MenuLpm { file, line, choice: index }),
            _ => Err(bad()),
        }
    }
}

impl Serialize for TextIdentifier {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TextIdentifier {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One translatable string as exchanged with translators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub id: TextIdentifier,
    /// Scenario label or menu label.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub original: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated: Option<String>,
}

impl TranslationUnit {
    fn pending(&self) -> Option<&str> {
        self.translated.as_deref().filter(|t| *t != self.original)
    }
}

/// Outcome of applying a batch of units to one script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TranslationReport {
    pub translated: usize,
    pub failed: usize,
    pub skipped: usize,
    /// One message per failed unit.
    pub errors: Vec<String>,
}

impl TranslationReport {
    fn fail(&mut self, err: LsbError) {
        warn!("{}", err);
        self.failed += 1;
        self.errors.push(err.to_string());
    }
}

impl fmt::Display for TranslationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} translated, {} failed, {} skipped",
            self.translated, self.failed, self.skipped
        )
    }
}

fn mismatch(id: &TextIdentifier, reason: impl Into<String>) -> LsbError {
    LsbError::IdentifierMismatch {
        id: id.to_string(),
        reason: reason.into(),
    }
}

pub fn units_to_json(units: &[TranslationUnit]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(units)
}

pub fn units_from_json(text: &str) -> serde_json::Result<Vec<TranslationUnit>> {
    serde_json::from_str(text)
}

impl Script {
    /// Narrative text blocks and menu choices, in the requested order.
    pub fn translation_units(&self, order: Order) -> Vec<TranslationUnit> {
        self.translation_units_with(order, None)
    }

    pub fn translation_units_with(&self, order: Order, preview: Option<&dyn PreviewMenuSource>) -> Vec<TranslationUnit> {
        let mut units = Vec::new();
        for scenario in self.text_scenarios(order) {
            for (block, b) in scenario.text.text_blocks().iter().enumerate() {
                units.push(TranslationUnit {
                    id: TextIdentifier::Text {
                        file: self.call_name.clone(),
                        line: scenario.line_no,
                        block,
                    },
                    name: scenario.name.to_string(),
                    speaker: b.name_label.clone(),
                    original: b.orig_text().to_string(),
                    translated: None,
                });
            }
        }
        for menu in self.selection_menus_with(order, preview) {
            let name = menu.label.clone().unwrap_or_default();
            for (choice, c) in menu.choices.iter().enumerate() {
                let file = self.call_name.clone();
                let line = menu.line_no;
                let id = match menu.kind {
                    MenuKind::Text => TextIdentifier::MenuText { file, line, choice },
                    MenuKind::Preview { .. } => TextIdentifier::MenuLpm { file, line, choice },
                };
                units.push(TranslationUnit {
                    id,
                    name: name.clone(),
                    speaker: None,
                    original: c.orig_text().to_string(),
                    translated: None,
                });
            }
        }
        units
    }

    /// Apply translated units addressed to this script. A unit whose
    /// identifier no longer matches the script is counted as failed and the
    /// rest are still applied.
    pub fn apply_translations(&mut self, units: &[TranslationUnit]) -> TranslationReport {
        let mut report = TranslationReport::default();
        let mut text: BTreeMap<u32, Vec<(&TranslationUnit, &str)>> = BTreeMap::new();
        let mut menus: BTreeMap<u32, Vec<(&TranslationUnit, &str)>> = BTreeMap::new();
        for unit in units {
            if unit.id.file() != self.call_name {
                report.skipped += 1;
                continue;
            }
            let Some(new_text) = unit.pending() else {
                report.skipped += 1;
                continue;
            };
            match unit.id {
                TextIdentifier::Text { line, .. } => text.entry(line).or_default().push((unit, new_text)),
                TextIdentifier::MenuText { line, .. } => menus.entry(line).or_default().push((unit, new_text)),
                TextIdentifier::MenuLpm { .. } => {
                    warn!("{}: preview menu choices are images and are not rewritten", unit.id);
                    report.skipped += 1;
                }
            }
        }
        for (line, group) in text {
            self.apply_text(line, &group, &mut report);
        }
        for (line, group) in menus {
            self.apply_menu(line, &group, &mut report);
        }
        report
    }

    fn apply_text(&mut self, line: u32, group: &[(&TranslationUnit, &str)], report: &mut TranslationReport) {
        let Some((_, cmd)) = self.command_at_line_mut(line) else {
            for (unit, _) in group {
                report.fail(mismatch(&unit.id, format!("no command on line {}", line)));
            }
            return;
        };
        let CommandKind::TextIns(ins) = &mut cmd.kind else {
            for (unit, _) in group {
                report.fail(mismatch(&unit.id, format!("line {} is not a TextIns command", line)));
            }
            return;
        };
        let mut blocks = ins.text.text_blocks();
        let mut done = Vec::new();
        for (unit, new_text) in group {
            let Some(block) = blocks.get_mut(unit.id.index()) else {
                report.fail(mismatch(&unit.id, "text block does not exist"));
                continue;
            };
            if block.orig_text() != unit.original {
                report.fail(mismatch(
                    &unit.id,
                    format!("text is {:?}, expected {:?}", block.orig_text(), unit.original),
                ));
                continue;
            }
            if let Err(e) = encode_cp932(new_text) {
                report.fail(e);
                continue;
            }
            block.text = new_text.to_string();
            done.push(*unit);
        }
        match ins.text.replace_text_blocks(&blocks, true) {
            Ok(()) => {
                for unit in done {
                    info!("translated {}: {:?}", unit.id, unit.original);
                    report.translated += 1;
                }
            }
            Err(e) => {
                for unit in done {
                    report.fail(mismatch(&unit.id, e.to_string()));
                }
            }
        }
    }

    fn apply_menu(&mut self, line: u32, group: &[(&TranslationUnit, &str)], report: &mut TranslationReport) {
        let menu = self
            .command_at_line(line)
            .ok_or_else(|| format!("no command on line {}", line))
            .and_then(|(index, _)| self.selection_menu(index, None).map_err(|e| e.to_string()));
        let mut menu = match menu {
            Ok(menu) => menu,
            Err(reason) => {
                for (unit, _) in group {
                    report.fail(mismatch(&unit.id, reason.clone()));
                }
                return;
            }
        };
        let mut done = Vec::new();
        for (unit, new_text) in group {
            let index = unit.id.index();
            match menu.choices.get(index) {
                None => {
                    report.fail(mismatch(&unit.id, "menu choice does not exist"));
                    continue;
                }
                Some(c) if c.orig_text() != unit.original => {
                    report.fail(mismatch(
                        &unit.id,
                        format!("choice is {:?}, expected {:?}", c.orig_text(), unit.original),
                    ));
                    continue;
                }
                Some(_) => {}
            }
            if let Err(e) = menu.set_choice_text(index, new_text) {
                report.fail(e);
                continue;
            }
            done.push(*unit);
        }
        match self.save_menu_choices(&mut menu) {
            Ok(()) => {
                for unit in done {
                    info!("translated {}: {:?}", unit.id, unit.original);
                    report.translated += 1;
                }
            }
            Err(e) => {
                for unit in done {
                    report.fail(mismatch(&unit.id, e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{units_from_json, units_to_json, TextIdentifier, TranslationUnit};
    use crate::command::{Command, CommandKind};
    use crate::expr::Param;
    use crate::menu::tests::menu_script;
    use crate::script::tests::{calc, label, script, text, PAGE};
    use crate::script::{Order, Script};
    use crate::LsbError;

    fn scenario_script() -> Script {
        script(vec![
            label(1, 0, "intro"),
            Command::new(
                2,
                0,
                CommandKind::Calc {
                    calc: calc("MessageBox", Param::from(true)),
                },
            ),
            text(3, 0, "A\nB"),
        ])
    }

    #[test]
    fn identifiers_round_trip_through_text() {
        let ids = [
            "pylm:text:00000001.lsb:12:0",
            "pylm:menu-text:00000001.lsb:40:2",
            "pylm:menu-lpm:sub:dir.lsb:7:1",
        ];
        for s in ids {
            let id: TextIdentifier = s.parse().unwrap();
            assert_eq!(id.to_string(), s);
        }
        let id: TextIdentifier = ids[2].parse().unwrap();
        assert_eq!(id.file(), "sub:dir.lsb");
        assert_eq!((id.line(), id.index()), (7, 1));
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for s in [
            "",
            "pylm:text",
            "pylm:text:a.lsb:x:0",
            "pylm:text:a.lsb:1:-1",
            "pylm:text::1:0",
            "pylm:menu:a.lsb:1:0",
            "other:text:a.lsb:1:0",
        ] {
            assert!(matches!(s.parse::<TextIdentifier>(), Err(LsbError::BadIdentifier(_))), "{}", s);
        }
    }

    #[test]
    fn extracts_labelled_text_block() {
        let units = scenario_script().translation_units(Order::File);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id.to_string(), format!("pylm:text:{}:3:0", PAGE));
        assert_eq!(units[0].name, "intro");
        assert_eq!(units[0].original, "A\nB");
    }

    #[test]
    fn units_serialize_with_string_ids() {
        let mut units = scenario_script().translation_units(Order::File);
        units[0].translated = Some("X".to_string());
        let json = units_to_json(&units).unwrap();
        assert!(json.contains(&format!("\"id\": \"pylm:text:{}:3:0\"", PAGE)));
        assert!(!json.contains("speaker"));
        assert_eq!(units_from_json(&json).unwrap(), units);
        assert!(units_from_json(r#"[{"id": "pylm:bad", "original": ""}]"#).is_err());
    }

    #[test]
    fn applies_text_and_reports_mismatches() {
        let mut s = scenario_script();
        let mut units = s.translation_units(Order::File);
        units[0].translated = Some("Hello\nworld".to_string());

        let mut stale = units[0].clone();
        stale.id = TextIdentifier::Text {
            file: PAGE.to_string(),
            line: 3,
            block: 4,
        };
        let mut wrong_line = units[0].clone();
        wrong_line.id = TextIdentifier::Text {
            file: PAGE.to_string(),
            line: 1,
            block: 0,
        };
        let mut elsewhere = units[0].clone();
        elsewhere.id = TextIdentifier::Text {
            file: "other.lsb".to_string(),
            line: 3,
            block: 0,
        };
        let untranslated = TranslationUnit {
            translated: None,
            ..units[0].clone()
        };
        units.extend([stale, wrong_line, elsewhere, untranslated]);

        let report = s.apply_translations(&units);
        assert_eq!((report.translated, report.failed, report.skipped), (1, 2, 2));
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.to_string(), "1 translated, 2 failed, 2 skipped");

        let after = s.translation_units(Order::File);
        assert_eq!(after[0].original, "Hello\nworld");
        assert!(s.to_bytes().is_ok());
    }

    #[test]
    fn changed_original_is_not_applied() {
        let mut s = scenario_script();
        let mut units = s.translation_units(Order::File);
        units[0].original = "A\nC".to_string();
        units[0].translated = Some("X".to_string());
        let report = s.apply_translations(&units);
        assert_eq!(report.failed, 1);
        assert_eq!(s.translation_units(Order::File)[0].original, "A\nB");
    }

    #[test]
    fn applies_menu_choices() {
        let mut s = menu_script();
        let mut units = s.translation_units(Order::File);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id.to_string(), format!("pylm:menu-text:{}:2:0", PAGE));
        assert_eq!(units[0].name, "choice");
        units[0].translated = Some("Yes".to_string());
        units[1].translated = Some("No".to_string());

        let report = s.apply_translations(&units);
        assert_eq!(report.translated, 2);
        let texts: Vec<String> = s
            .selection_menus(Order::File)
            .remove(0)
            .choices
            .into_iter()
            .map(|c| c.text)
            .collect();
        assert_eq!(texts, vec!["Yes", "No"]);
    }

    #[test]
    fn unencodable_translation_fails_only_that_unit() {
        let mut s = menu_script();
        let mut units = s.translation_units(Order::File);
        units[0].translated = Some("한".to_string());
        units[1].translated = Some("No".to_string());
        let report = s.apply_translations(&units);
        assert_eq!((report.translated, report.failed), (1, 1));
        assert!(report.errors[0].contains('한'));
    }
}
