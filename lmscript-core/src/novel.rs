//! Compiled narrative text: the `TpWord` container, its glyph body and the
//! decorator/condition/link side tables the glyphs index into.

use log::debug;
use serde::Serialize;

use crate::codec::{decode_cp932, encode_char, Reader, Writer};
use crate::expr::LiveParser;
use crate::{LsbError, Result};

const SIGNATURE: &[u8; 6] = b"TpWord";

/// Newest TpWord version; also used for blocks compiled from scratch.
pub const DEFAULT_TPWORD_VERSION: u32 = 106;

const GLYPH_CHAR: u8 = 0x01;
const GLYPH_DIV: u8 = 0x02;
const GLYPH_RETURN: u8 = 0x03;
const GLYPH_INDENT: u8 = 0x04;
const GLYPH_UNDENT: u8 = 0x05;
const GLYPH_EVENT: u8 = 0x06;
const GLYPH_VAR: u8 = 0x07;
const GLYPH_IMG: u8 = 0x09;
const GLYPH_HISTCHAR: u8 = 0x0A;

/// Marks an engine (system) event: `\x01NAME\r\narg\r\narg`.
pub const SYSTEM_EVENT_MARK: char = '\u{1}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakType {
    Line,
    Page,
    Pause,
    Clear,
    Other(u8),
}

impl BreakType {
    pub fn from_u8(v: u8) -> BreakType {
        match v {
            0 => BreakType::Line,
            1 => BreakType::Page,
            2 => BreakType::Pause,
            3 => BreakType::Clear,
            other => BreakType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            BreakType::Line => 0,
            BreakType::Page => 1,
            BreakType::Pause => 2,
            BreakType::Clear => 3,
            BreakType::Other(v) => v,
        }
    }
}

/// Horizontal or vertical alignment shared by `DIV` and `IMG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Align {
    Left,
    Right,
    Center,
    Top,
    Bottom,
    Other(u8),
}

impl Align {
    pub fn from_u8(v: u8) -> Align {
        match v {
            1 => Align::Left,
            2 => Align::Right,
            3 => Align::Center,
            4 => Align::Top,
            5 => Align::Bottom,
            other => Align::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Align::Left => 1,
            Align::Right => 2,
            Align::Center => 3,
            Align::Top => 4,
            Align::Bottom => 5,
            Align::Other(v) => v,
        }
    }

    pub fn name(self) -> Option<&'static str> {
        match self {
            Align::Left => Some("LEFT"),
            Align::Right => Some("RIGHT"),
            Align::Center => Some("CENTER"),
            Align::Top => Some("TOP"),
            Align::Bottom => Some("BOTTOM"),
            Align::Other(_) => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Align> {
        match name.to_ascii_uppercase().as_str() {
            "LEFT" => Some(Align::Left),
            "RIGHT" => Some(Align::Right),
            "CENTER" => Some(Align::Center),
            "TOP" => Some(Align::Top),
            "BOTTOM" => Some(Align::Bottom),
            other => other.parse().ok().map(Align::from_u8),
        }
    }
}

/// One displayed character.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharGlyph {
    pub ch: char,
    pub decorator: i32,
    pub condition: Option<i32>,
    /// Link name, used by TpWord versions before 105.
    pub link_name: Option<String>,
    pub link: Option<i32>,
    pub text_speed: u32,
}

/// Variable echo (`VAR`) or history-only variable echo (`HISTCHAR`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarGlyph {
    pub condition: Option<i32>,
    pub decorator: i32,
    pub unk3: Option<u32>,
    pub link_name: Option<String>,
    pub link: Option<i32>,
    /// Variable name expression, used before version 102.
    pub var_name_params: Option<LiveParser>,
    pub var_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImgGlyph {
    pub condition: Option<i32>,
    pub link_name: Option<String>,
    pub link: Option<i32>,
    pub text_speed: u32,
    pub src: String,
    pub align: Align,
    pub hover_src: Option<String>,
    /// Left, right, top and bottom margins.
    pub margins: Option<[i32; 4]>,
    pub down_src: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Glyph {
    Char(CharGlyph),
    Div {
        condition: Option<i32>,
        align: Align,
        pad_left: Option<i32>,
        pad_right: Option<i32>,
        no_height: Option<u8>,
    },
    Return {
        condition: Option<i32>,
        break_type: BreakType,
    },
    Indent {
        condition: Option<i32>,
    },
    Undent {
        condition: Option<i32>,
    },
    Event {
        condition: Option<i32>,
        event: String,
    },
    Var(VarGlyph),
    Img(ImgGlyph),
    HistChar(VarGlyph),
    /// Unrecognised type byte; the engine skips these.
    Unknown(u8),
}

/// An event split into its name and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCall<'a> {
    pub system: bool,
    pub name: &'a str,
    pub args: Vec<&'a str>,
}

pub fn split_event(event: &str) -> EventCall<'_> {
    let mut parts = event.split("\r\n");
    let head = parts.next().unwrap_or("");
    let (system, name) = match head.strip_prefix(SYSTEM_EVENT_MARK) {
        Some(rest) => (true, rest),
        None => (false, head),
    };
    EventCall {
        system,
        name,
        args: parts.collect(),
    }
}

impl Glyph {
    pub fn condition(&self) -> Option<i32> {
        match self {
            Glyph::Char(c) => c.condition,
            Glyph::Var(v) | Glyph::HistChar(v) => v.condition,
            Glyph::Img(i) => i.condition,
            Glyph::Div { condition, .. }
            | Glyph::Return { condition, .. }
            | Glyph::Indent { condition }
            | Glyph::Undent { condition }
            | Glyph::Event { condition, .. } => *condition,
            Glyph::Unknown(_) => None,
        }
    }

    pub fn decorator(&self) -> Option<i32> {
        match self {
            Glyph::Char(c) => Some(c.decorator),
            Glyph::Var(v) | Glyph::HistChar(v) => Some(v.decorator),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<i32> {
        match self {
            Glyph::Char(c) => c.link,
            Glyph::Var(v) | Glyph::HistChar(v) => v.link,
            Glyph::Img(i) => i.link,
            _ => None,
        }
    }

    pub fn link_name(&self) -> Option<&str> {
        match self {
            Glyph::Char(c) => c.link_name.as_deref(),
            Glyph::Var(v) | Glyph::HistChar(v) => v.link_name.as_deref(),
            Glyph::Img(i) => i.link_name.as_deref(),
            _ => None,
        }
    }

    pub fn text_speed(&self) -> Option<u32> {
        match self {
            Glyph::Char(c) => Some(c.text_speed),
            Glyph::Img(i) => Some(i.text_speed),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<char> {
        match self {
            Glyph::Char(c) => Some(c.ch),
            _ => None,
        }
    }

    pub fn is_line_break(&self) -> bool {
        matches!(
            self,
            Glyph::Return {
                break_type: BreakType::Line,
                ..
            }
        )
    }

    fn type_byte(&self) -> u8 {
        match self {
            Glyph::Char(_) => GLYPH_CHAR,
            Glyph::Div { .. } => GLYPH_DIV,
            Glyph::Return { .. } => GLYPH_RETURN,
            Glyph::Indent { .. } => GLYPH_INDENT,
            Glyph::Undent { .. } => GLYPH_UNDENT,
            Glyph::Event { .. } => GLYPH_EVENT,
            Glyph::Var(_) => GLYPH_VAR,
            Glyph::Img(_) => GLYPH_IMG,
            Glyph::HistChar(_) => GLYPH_HISTCHAR,
            Glyph::Unknown(b) => *b,
        }
    }

    fn decode(r: &mut Reader, version: u32, index: usize) -> Result<Glyph> {
        let ty = r.u8()?;
        if !matches!(
            ty,
            GLYPH_CHAR
                | GLYPH_DIV
                | GLYPH_RETURN
                | GLYPH_INDENT
                | GLYPH_UNDENT
                | GLYPH_EVENT
                | GLYPH_VAR
                | GLYPH_IMG
                | GLYPH_HISTCHAR
        ) {
            return Ok(Glyph::Unknown(ty));
        }
        let condition = r.read_if(version >= 104, |r| r.i32())?;
        let glyph = match ty {
            GLYPH_CHAR => {
                let (link_name, link, text_speed) = decode_real(r, version)?;
                let raw = r.u16()?;
                let ch = decode_char_code(raw).ok_or_else(|| LsbError::MalformedGlyph {
                    index,
                    reason: format!("invalid character code {:#06x}", raw),
                })?;
                Glyph::Char(CharGlyph {
                    ch,
                    decorator: r.i32()?,
                    condition,
                    link_name,
                    link,
                    text_speed,
                })
            }
            GLYPH_DIV => {
                let align = Align::from_u8(r.u8()?);
                let pad_left = r.read_if(version >= 105, |r| r.i32())?;
                let pad_right = r.read_if(version >= 105, |r| r.i32())?;
                let no_height = r.read_if(version >= 105, |r| r.u8())?;
                Glyph::Div {
                    condition,
                    align,
                    pad_left,
                    pad_right,
                    no_height,
                }
            }
            GLYPH_RETURN => Glyph::Return {
                condition,
                break_type: BreakType::from_u8(r.u8()?),
            },
            GLYPH_INDENT => Glyph::Indent { condition },
            GLYPH_UNDENT => Glyph::Undent { condition },
            GLYPH_EVENT => Glyph::Event {
                condition,
                event: r.string()?,
            },
            GLYPH_VAR | GLYPH_HISTCHAR => {
                let var = VarGlyph {
                    condition,
                    decorator: r.i32()?,
                    unk3: r.read_if(version > 100, |r| r.u32())?,
                    link_name: r.read_if(version > 100 && version < 105, |r| r.string())?,
                    link: r.read_if(version >= 105, |r| r.i32())?,
                    var_name_params: r.read_if(version < 102, LiveParser::decode)?,
                    var_name: r.read_if(version >= 102, |r| r.string())?,
                };
                if ty == GLYPH_VAR {
                    Glyph::Var(var)
                } else {
                    Glyph::HistChar(var)
                }
            }
            _ => {
                let (link_name, link, text_speed) = decode_real(r, version)?;
                let src = r.string()?;
                let align = Align::from_u8(r.u8()?);
                let hover_src = r.read_if(version >= 103, |r| r.string())?;
                let margins = r.read_if(version >= 105, |r| Ok([r.i32()?, r.i32()?, r.i32()?, r.i32()?]))?;
                let down_src = r.read_if(version >= 105, |r| r.string())?;
                Glyph::Img(ImgGlyph {
                    condition,
                    link_name,
                    link,
                    text_speed,
                    src,
                    align,
                    hover_src,
                    margins,
                    down_src,
                })
            }
        };
        Ok(glyph)
    }

    fn encode(&self, w: &mut Writer, version: u32) -> Result<()> {
        w.u8(self.type_byte());
        if let Glyph::Unknown(_) = self {
            return Ok(());
        }
        w.write_if(version >= 104, &self.condition(), |w, v| {
            w.i32(*v);
            Ok(())
        })?;
        match self {
            Glyph::Char(c) => {
                encode_real(w, version, &c.link_name, c.link, c.text_speed)?;
                w.u16(encode_char_code(c.ch)?);
                w.i32(c.decorator);
            }
            Glyph::Div {
                align,
                pad_left,
                pad_right,
                no_height,
                ..
            } => {
                w.u8(align.to_u8());
                w.write_if(version >= 105, pad_left, |w, v| {
                    w.i32(*v);
                    Ok(())
                })?;
                w.write_if(version >= 105, pad_right, |w, v| {
                    w.i32(*v);
                    Ok(())
                })?;
                w.write_if(version >= 105, no_height, |w, v| {
                    w.u8(*v);
                    Ok(())
                })?;
            }
            Glyph::Return { break_type, .. } => w.u8(break_type.to_u8()),
            Glyph::Indent { .. } | Glyph::Undent { .. } | Glyph::Unknown(_) => {}
            Glyph::Event { event, .. } => w.string(event)?,
            Glyph::Var(v) | Glyph::HistChar(v) => {
                w.i32(v.decorator);
                w.write_if(version > 100, &v.unk3, |w, x| {
                    w.u32(*x);
                    Ok(())
                })?;
                w.write_if(version > 100 && version < 105, &v.link_name, |w, s| w.string(s))?;
                w.write_if(version >= 105, &v.link, |w, x| {
                    w.i32(*x);
                    Ok(())
                })?;
                w.write_if(version < 102, &v.var_name_params, |w, p| p.encode(w))?;
                w.write_if(version >= 102, &v.var_name, |w, s| w.string(s))?;
            }
            Glyph::Img(i) => {
                encode_real(w, version, &i.link_name, i.link, i.text_speed)?;
                w.string(&i.src)?;
                w.u8(i.align.to_u8());
                w.write_if(version >= 103, &i.hover_src, |w, s| w.string(s))?;
                w.write_if(version >= 105, &i.margins, |w, m| {
                    for v in m {
                        w.i32(*v);
                    }
                    Ok(())
                })?;
                w.write_if(version >= 105, &i.down_src, |w, s| w.string(s))?;
            }
        }
        Ok(())
    }
}

fn decode_real(r: &mut Reader, version: u32) -> Result<(Option<String>, Option<i32>, u32)> {
    let link_name = r.read_if(version < 105, |r| r.string())?;
    let link = r.read_if(version >= 105, |r| r.i32())?;
    Ok((link_name, link, r.u32()?))
}

fn encode_real(w: &mut Writer, version: u32, link_name: &Option<String>, link: Option<i32>, speed: u32) -> Result<()> {
    w.write_if(version < 105, link_name, |w, s| w.string(s))?;
    w.write_if(version >= 105, &link, |w, v| {
        w.i32(*v);
        Ok(())
    })?;
    w.u32(speed);
    Ok(())
}

/// Characters are stored as their CP932 bytes read big-endian into a u16,
/// so single-byte characters have a zero high byte.
fn decode_char_code(raw: u16) -> Option<char> {
    let [hi, lo] = raw.to_be_bytes();
    let text = if hi == 0 {
        decode_cp932(&[lo])?
    } else {
        decode_cp932(&[hi, lo])?
    };
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Some(ch),
        _ => None,
    }
}

fn encode_char_code(ch: char) -> Result<u16> {
    let bytes = encode_char(ch)?;
    Ok(match bytes.as_slice() {
        [b] => u16::from(*b),
        [hi, lo] => u16::from_be_bytes([*hi, *lo]),
        _ => return Err(LsbError::Encoding { ch }),
    })
}

/// Font style run; `ruby` carries furigana text for the styled span.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Decorator {
    pub count: u32,
    pub unk2: u32,
    pub unk3: u32,
    pub unk4: u32,
    pub unk5: u8,
    pub unk6: u8,
    /// A single byte before version 100.
    pub unk7: u32,
    pub unk8: String,
    pub ruby: String,
    pub unk10: Option<u32>,
    pub unk11: Option<u32>,
}

impl Decorator {
    fn decode(r: &mut Reader, version: u32) -> Result<Decorator> {
        Ok(Decorator {
            count: r.u32()?,
            unk2: r.u32()?,
            unk3: r.u32()?,
            unk4: r.u32()?,
            unk5: r.u8()?,
            unk6: r.u8()?,
            unk7: if version < 100 { u32::from(r.u8()?) } else { r.u32()? },
            unk8: r.string()?,
            ruby: r.string()?,
            unk10: r.read_if(version >= 100, |r| r.u32())?,
            unk11: r.read_if(version >= 100, |r| r.u32())?,
        })
    }

    fn encode(&self, w: &mut Writer, version: u32) -> Result<()> {
        w.u32(self.count);
        w.u32(self.unk2);
        w.u32(self.unk3);
        w.u32(self.unk4);
        w.u8(self.unk5);
        w.u8(self.unk6);
        if version < 100 {
            w.u8(self.unk7 as u8);
        } else {
            w.u32(self.unk7);
        }
        w.string(&self.unk8)?;
        w.string(&self.ruby)?;
        for v in [&self.unk10, &self.unk11] {
            w.write_if(version >= 100, v, |w, x| {
                w.u32(*x);
                Ok(())
            })?;
        }
        Ok(())
    }
}

/// Display condition such as history-only text.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Condition {
    pub count: u32,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Link {
    pub count: u32,
    pub event: String,
    pub unk3: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableCounts {
    decorators: Vec<u32>,
    conditions: Option<Vec<u32>>,
    links: Option<Vec<u32>>,
}

/// One compiled text block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TpWord {
    pub version: u32,
    pub decorators: Vec<Decorator>,
    /// Present from version 104.
    pub conditions: Option<Vec<Condition>>,
    /// Present from version 105.
    pub links: Option<Vec<Link>>,
    body: Vec<Glyph>,
    /// Bytes after the body inside the enclosing length prefix.
    pub trailer: Vec<u8>,
    #[serde(skip)]
    loaded_counts: Option<TableCounts>,
}

impl TpWord {
    /// Empty block with the side tables its version carries.
    pub fn new(version: u32) -> TpWord {
        TpWord {
            version,
            decorators: Vec::new(),
            conditions: (version >= 104).then(Vec::new),
            links: (version >= 105).then(Vec::new),
            body: Vec::new(),
            trailer: Vec::new(),
            loaded_counts: None,
        }
    }

    pub fn body(&self) -> &[Glyph] {
        &self.body
    }

    pub fn parse(bytes: &[u8]) -> Result<TpWord> {
        let mut r = Reader::new(bytes);
        let mut tp = TpWord::decode(&mut r)?;
        tp.trailer = r.rest().to_vec();
        Ok(tp)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        self.encode(&mut w)?;
        w.bytes(&self.trailer);
        Ok(w.into_inner())
    }

    fn decode(r: &mut Reader) -> Result<TpWord> {
        let offset = r.position();
        if r.take(SIGNATURE.len())? != SIGNATURE {
            return Err(LsbError::BadSignature {
                offset,
                expected: "TpWord",
            });
        }
        let offset = r.position();
        let digits = r.take(3)?;
        let version = std::str::from_utf8(digits)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or(LsbError::BadSignature {
                offset,
                expected: "3 digit TpWord version",
            })?;
        let decorators = r.array(|r| Decorator::decode(r, version))?;
        let conditions = r.read_if(version >= 104, |r| {
            r.array(|r| {
                Ok(Condition {
                    count: r.u32()?,
                    target: r.string()?,
                })
            })
        })?;
        let links = r.read_if(version >= 105, |r| {
            r.array(|r| {
                Ok(Link {
                    count: r.u32()?,
                    event: r.string()?,
                    unk3: r.string()?,
                })
            })
        })?;
        let count = r.count()?;
        let mut body = Vec::with_capacity(count);
        for i in 0..count {
            body.push(Glyph::decode(r, version, i)?);
        }
        let mut tp = TpWord {
            version,
            decorators,
            conditions,
            links,
            body,
            trailer: Vec::new(),
            loaded_counts: None,
        };
        tp.loaded_counts = Some(tp.stored_counts());
        Ok(tp)
    }

    fn encode(&self, w: &mut Writer) -> Result<()> {
        self.check_counts()?;
        if self.version > 999 {
            return Err(LsbError::Unsupported(format!("TpWord version {}", self.version)));
        }
        w.bytes(SIGNATURE);
        w.bytes(format!("{:03}", self.version).as_bytes());
        let version = self.version;
        w.array(&self.decorators, |w, d| d.encode(w, version))?;
        w.write_if(version >= 104, &self.conditions, |w, conds| {
            w.array(conds, |w, c| {
                w.u32(c.count);
                w.string(&c.target)
            })
        })?;
        w.write_if(version >= 105, &self.links, |w, links| {
            w.array(links, |w, l| {
                w.u32(l.count);
                w.string(&l.event)?;
                w.string(&l.unk3)
            })
        })?;
        w.array(&self.body, |w, g| g.encode(w, version))
    }

    fn stored_counts(&self) -> TableCounts {
        TableCounts {
            decorators: self.decorators.iter().map(|d| d.count).collect(),
            conditions: self.conditions.as_ref().map(|c| c.iter().map(|c| c.count).collect()),
            links: self.links.as_ref().map(|l| l.iter().map(|l| l.count).collect()),
        }
    }

    /// Count glyph references into each side table. Negative indices refer
    /// to no entry.
    fn reference_counts(&self, body: &[Glyph]) -> Result<TableCounts> {
        fn bump(counts: &mut [u32], idx: Option<i32>, glyph: usize, table: &str) -> Result<()> {
            let Some(idx) = idx.filter(|i| *i >= 0) else {
                return Ok(());
            };
            match counts.get_mut(idx as usize) {
                Some(c) => {
                    *c += 1;
                    Ok(())
                }
                None => Err(LsbError::MalformedGlyph {
                    index: glyph,
                    reason: format!("references {} #{} which does not exist", table, idx),
                }),
            }
        }
        let mut counts = TableCounts {
            decorators: vec![0; self.decorators.len()],
            conditions: self.conditions.as_ref().map(|c| vec![0; c.len()]),
            links: self.links.as_ref().map(|l| vec![0; l.len()]),
        };
        for (i, g) in body.iter().enumerate() {
            bump(&mut counts.decorators, g.decorator(), i, "decorator")?;
            if let Some(c) = counts.conditions.as_mut() {
                bump(c, g.condition(), i, "condition")?;
            }
            if let Some(l) = counts.links.as_mut() {
                bump(l, g.link(), i, "link")?;
            }
        }
        Ok(counts)
    }

    fn check_counts(&self) -> Result<()> {
        let stored = self.stored_counts();
        // a parsed block is written back verbatim until its body or tables change
        if self.loaded_counts.as_ref() == Some(&stored) {
            return Ok(());
        }
        let expected = self.reference_counts(&self.body)?;
        let tables: [(&'static str, Option<&Vec<u32>>, Option<&Vec<u32>>); 3] = [
            ("decorator", Some(&stored.decorators), Some(&expected.decorators)),
            ("condition", stored.conditions.as_ref(), expected.conditions.as_ref()),
            ("link", stored.links.as_ref(), expected.links.as_ref()),
        ];
        for (table, have, want) in tables {
            let (Some(have), Some(want)) = (have, want) else {
                continue;
            };
            for (index, (count, expected)) in have.iter().zip(want).enumerate() {
                if count != expected {
                    return Err(LsbError::CountMismatch {
                        table,
                        index,
                        count: *count,
                        expected: *expected,
                    });
                }
            }
        }
        Ok(())
    }

    /// Replace the glyph body, recomputing every side table count.
    pub fn replace_body(&mut self, body: Vec<Glyph>) -> Result<()> {
        for (i, g) in body.iter().enumerate() {
            if g.link_name().is_some_and(|n| !n.is_empty()) {
                return Err(LsbError::Unsupported(format!(
                    "glyph #{} uses a named link; named links from TpWord versions before 105 cannot be rewritten",
                    i
                )));
            }
        }
        let counts = self.reference_counts(&body)?;
        for (d, c) in self.decorators.iter_mut().zip(&counts.decorators) {
            d.count = *c;
        }
        if let (Some(conds), Some(counts)) = (self.conditions.as_mut(), counts.conditions.as_ref()) {
            for (cond, c) in conds.iter_mut().zip(counts) {
                cond.count = *c;
            }
        }
        if let (Some(links), Some(counts)) = (self.links.as_mut(), counts.links.as_ref()) {
            for (link, c) in links.iter_mut().zip(counts) {
                link.count = *c;
            }
        }
        self.body = body;
        self.loaded_counts = None;
        Ok(())
    }

    /// Replace the body and update ruby text on the given decorators.
    pub fn replace_body_with_ruby(&mut self, body: Vec<Glyph>, ruby: &[(usize, String)]) -> Result<()> {
        for (id, _) in ruby {
            if *id >= self.decorators.len() {
                return Err(LsbError::MalformedGlyph {
                    index: *id,
                    reason: "ruby text references a decorator that does not exist".to_string(),
                });
            }
        }
        self.replace_body(body)?;
        for (id, text) in ruby {
            if let Some(dec) = self.decorators.get_mut(*id) {
                if dec.ruby != *text {
                    debug!("updating ruby text of decorator {}", id);
                    dec.ruby = text.clone();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{split_event, Align, BreakType, CharGlyph, Condition, Decorator, Glyph, ImgGlyph, Link, TpWord, VarGlyph};
    use crate::LsbError;

    pub(crate) fn ch(c: char) -> Glyph {
        Glyph::Char(CharGlyph {
            ch: c,
            decorator: 0,
            condition: Some(0),
            link_name: None,
            link: Some(0),
            text_speed: 50,
        })
    }

    pub(crate) fn br() -> Glyph {
        Glyph::Return {
            condition: Some(0),
            break_type: BreakType::Line,
        }
    }

    /// Version 105 block with one entry in each table.
    pub(crate) fn sample(body: Vec<Glyph>) -> TpWord {
        let mut tp = TpWord::new(105);
        tp.decorators.push(Decorator {
            unk7: 1,
            unk8: "MS Gothic".to_string(),
            unk10: Some(0),
            unk11: Some(0),
            ..Decorator::default()
        });
        tp.conditions = Some(vec![Condition::default()]);
        tp.links = Some(vec![Link::default()]);
        tp.replace_body(body).unwrap();
        tp
    }

    #[test]
    fn counts_follow_body() {
        let tp = sample(vec![ch('A'), br(), ch('B')]);
        assert_eq!(tp.decorators[0].count, 2);
        assert_eq!(tp.conditions.as_ref().unwrap()[0].count, 3);
        assert_eq!(tp.links.as_ref().unwrap()[0].count, 2);
    }

    #[test]
    fn round_trips_every_glyph_kind() {
        let var = VarGlyph {
            condition: Some(0),
            decorator: 0,
            unk3: Some(7),
            link_name: None,
            link: Some(0),
            var_name_params: None,
            var_name: Some("名前".to_string()),
        };
        let body = vec![
            Glyph::Div {
                condition: Some(0),
                align: Align::Center,
                pad_left: Some(4),
                pad_right: Some(-4),
                no_height: Some(1),
            },
            ch('あ'),
            ch('ｱ'),
            Glyph::Indent { condition: Some(0) },
            Glyph::Event {
                condition: Some(0),
                event: "\u{1}NAMELABEL\r\nアリス".to_string(),
            },
            Glyph::Var(var.clone()),
            Glyph::HistChar(var),
            Glyph::Img(ImgGlyph {
                condition: Some(0),
                link_name: None,
                link: Some(0),
                text_speed: 50,
                src: "icon.gal".to_string(),
                align: Align::Bottom,
                hover_src: Some(String::new()),
                margins: Some([1, 2, 3, 4]),
                down_src: Some(String::new()),
            }),
            Glyph::Undent { condition: Some(0) },
            Glyph::Return {
                condition: Some(0),
                break_type: BreakType::Pause,
            },
        ];
        let tp = sample(body);
        let bytes = tp.to_bytes().unwrap();
        assert_eq!(&bytes[..9], b"TpWord105");
        let parsed = TpWord::parse(&bytes).unwrap();
        assert_eq!(parsed.body(), tp.body());
        assert_eq!(parsed.decorators, tp.decorators);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn char_codes_are_big_endian_cp932() {
        let tp = sample(vec![ch('あ')]);
        let bytes = tp.to_bytes().unwrap();
        // type, condition, link, speed, then the character code
        let at = bytes.len() - 4 - 2;
        assert_eq!(&bytes[at..at + 2], &[0xA0, 0x82]);
    }

    #[test]
    fn old_versions_omit_newer_fields() {
        let mut tp = TpWord::new(103);
        tp.decorators.push(Decorator::default());
        tp.replace_body(vec![Glyph::Char(CharGlyph {
            ch: 'x',
            decorator: 0,
            condition: None,
            link_name: Some(String::new()),
            link: None,
            text_speed: 0,
        })])
        .unwrap();
        let bytes = tp.to_bytes().unwrap();
        let parsed = TpWord::parse(&bytes).unwrap();
        assert!(parsed.conditions.is_none());
        assert!(parsed.links.is_none());
        assert_eq!(parsed.body(), tp.body());
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut tp = sample(vec![]);
        let mut bad = ch('A');
        if let Glyph::Char(c) = &mut bad {
            c.decorator = 3;
        }
        assert!(matches!(
            tp.replace_body(vec![ch('B'), bad]),
            Err(LsbError::MalformedGlyph { index: 1, .. })
        ));
    }

    #[test]
    fn corrupted_count_is_rejected_on_serialize() {
        let mut tp = sample(vec![ch('A')]);
        let bytes = tp.to_bytes().unwrap();
        let mut parsed = TpWord::parse(&bytes).unwrap();
        assert!(parsed.to_bytes().is_ok());
        parsed.decorators[0].count = 99;
        assert!(matches!(
            parsed.to_bytes(),
            Err(LsbError::CountMismatch { table: "decorator", index: 0, count: 99, expected: 1 })
        ));
        tp.links.as_mut().unwrap()[0].count = 5;
        assert!(matches!(tp.to_bytes(), Err(LsbError::CountMismatch { table: "link", .. })));
    }

    #[test]
    fn named_links_cannot_be_rewritten() {
        let mut tp = sample(vec![]);
        let mut g = ch('A');
        if let Glyph::Char(c) = &mut g {
            c.link_name = Some("jump".to_string());
        }
        assert!(matches!(tp.replace_body(vec![g]), Err(LsbError::Unsupported(_))));
    }

    #[test]
    fn unknown_glyph_types_are_kept() {
        let mut bytes = sample(vec![ch('A')]).to_bytes().unwrap();
        // bump body count and append an unknown type byte
        let body_at = bytes.len() - (1 + 4 + 4 + 4 + 2 + 4) - 4;
        bytes[body_at] = 2;
        bytes.push(0x08);
        let tp = TpWord::parse(&bytes).unwrap();
        assert_eq!(tp.body()[1], Glyph::Unknown(0x08));
        assert_eq!(tp.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn rejects_bad_signature() {
        assert!(matches!(TpWord::parse(b"TpWorx105"), Err(LsbError::BadSignature { .. })));
        assert!(matches!(TpWord::parse(b"TpWord1x5"), Err(LsbError::BadSignature { .. })));
    }

    #[test]
    fn ruby_updates_decorator() {
        let mut tp = sample(vec![]);
        tp.replace_body_with_ruby(vec![ch('漢')], &[(0, "かん".to_string())]).unwrap();
        assert_eq!(tp.decorators[0].ruby, "かん");
        assert!(tp.replace_body_with_ruby(vec![], &[(4, String::new())]).is_err());
    }

    #[test]
    fn splits_system_events() {
        let ev = split_event("\u{1}NAMELABEL\r\nアリス");
        assert!(ev.system);
        assert_eq!(ev.name, "NAMELABEL");
        assert_eq!(ev.args, vec!["アリス"]);
        let plain = split_event("PlaySE");
        assert!(!plain.system);
        assert!(plain.args.is_empty());
    }
}
