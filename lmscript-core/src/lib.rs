//! Reading, translating and rewriting LiveMaker compiled scripts (LSB) and
//! the narrative text (TpWord) they embed.

use thiserror::Error;

mod codec;
pub mod command;
pub mod expr;
pub mod flow;
pub mod lns;
pub mod menu;
pub mod novel;
pub mod property;
pub mod script;
pub mod text;
pub mod translate;

pub use codec::{decode_cp932, encode_cp932, pack_flags, unpack_flags};
pub use command::{Command, CommandKind, CommandType, Components, LabelReference, LabelTarget};
pub use expr::{Extended, LiveParser, OpeData, OpeDataType, OpeFunc, Param, ParamType, Token};
pub use flow::{FlowEdge, WalkStep};
pub use lns::{Compiled, Compiler, Decompiler};
pub use menu::{MenuChoice, MenuKind, NotAMenu, PreviewMenuSource, SelectionMenu};
pub use novel::{BreakType, Glyph, TpWord};
pub use property::PropertyType;
pub use script::{Order, Script};
pub use text::{TextBlock, TextBlocks};
pub use translate::{TextIdentifier, TranslationReport, TranslationUnit};

/// Oldest LSB format version this crate reads and writes.
pub const MIN_LSB_VERSION: u32 = 103;
/// Newest LSB format version this crate reads and writes.
pub const MAX_LSB_VERSION: u32 = 117;
/// Version used for scripts built from scratch.
pub const DEFAULT_LSB_VERSION: u32 = 117;

#[derive(Debug, Error)]
pub enum LsbError {
    #[error("truncated data at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("bad signature at offset {offset}: expected {expected:?}")]
    BadSignature { offset: usize, expected: &'static str },

    #[error("unsupported LSB version {0} (supported {MIN_LSB_VERSION}..={MAX_LSB_VERSION})")]
    UnsupportedVersion(u32),

    #[error("invalid {what} value {value:#x} at offset {offset}")]
    InvalidTag {
        what: &'static str,
        value: u32,
        offset: usize,
    },

    #[error("invalid CP932 string at offset {offset}")]
    InvalidString { offset: usize },

    #[error("{count} unexpected trailing bytes at offset {offset}")]
    TrailingData { offset: usize, count: usize },

    #[error("character {ch:?} (U+{:04X}) cannot be encoded as CP932", u32::from(*.ch))]
    Encoding { ch: char },

    #[error("malformed command on line {line}: {reason}")]
    MalformedCommand { line: u32, reason: String },

    #[error("malformed glyph #{index}: {reason}")]
    MalformedGlyph { index: usize, reason: String },

    #[error("{table} #{index} has count {count} but {expected} glyphs reference it")]
    CountMismatch {
        table: &'static str,
        index: usize,
        count: u32,
        expected: u32,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("identifier {id} does not match target: {reason}")]
    IdentifierMismatch { id: String, reason: String },

    #[error("invalid text identifier '{0}'")]
    BadIdentifier(String),
}

pub type Result<T> = std::result::Result<T, LsbError>;

/// Engine generation for a script format version (LiveMaker 2 or 3).
pub fn lm_version(lsb_version: u32) -> u32 {
    if lsb_version < 117 {
        2
    } else {
        3
    }
}

/// Check that `version` is within the supported LSB range.
pub fn check_version(version: u32) -> Result<()> {
    if (MIN_LSB_VERSION..=MAX_LSB_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(LsbError::UnsupportedVersion(version))
    }
}
