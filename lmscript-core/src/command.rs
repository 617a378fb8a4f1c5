//! Script commands: a common header plus kind-specific, version-gated fields.

use serde::Serialize;
use std::fmt;

use crate::codec::{Reader, Writer};
use crate::expr::{LiveParser, ParamType};
use crate::novel::TpWord;
use crate::property::PropertyType;
use crate::{LsbError, Result};

const STOP_EVENT_SINCE: u32 = 107;
const FLIP_SOURCE_SINCE: u32 = 101;
const DIFFERENCE_ONLY_SINCE: u32 = 117;
const FORMAT_NAME_SINCE: u32 = 111;
const SAVE_LABEL_SINCE: u32 = 105;
const PAUSED_SINCE: u32 = 108;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandType {
    If = 0x00,
    Elseif = 0x01,
    Else = 0x02,
    Label = 0x03,
    Jump = 0x04,
    Call = 0x05,
    Exit = 0x06,
    Wait = 0x07,
    BoxNew = 0x08,
    ImgNew = 0x09,
    MesNew = 0x0A,
    Timer = 0x0B,
    Movie = 0x0C,
    Flip = 0x0D,
    Calc = 0x0E,
    VarNew = 0x0F,
    VarDel = 0x10,
    GetProp = 0x11,
    SetProp = 0x12,
    ObjDel = 0x13,
    TextIns = 0x14,
    MovieStop = 0x15,
    ClrHist = 0x16,
    Cinema = 0x17,
    Caption = 0x18,
    Menu = 0x19,
    MenuClose = 0x1A,
    Comment = 0x1B,
    TextClr = 0x1C,
    CallHist = 0x1D,
    Button = 0x1E,
    While = 0x1F,
    WhileInit = 0x20,
    WhileLoop = 0x21,
    Break = 0x22,
    Continue = 0x23,
    ParticleNew = 0x24,
    FireNew = 0x25,
    GameSave = 0x26,
    GameLoad = 0x27,
    PcReset = 0x28,
    Reset = 0x29,
    Sound = 0x2A,
    EditNew = 0x2B,
    MemoNew = 0x2C,
    Terminate = 0x2D,
    DoEvent = 0x2E,
    ClrRead = 0x2F,
    MapImgNew = 0x30,
    WaveNew = 0x31,
    TileNew = 0x32,
    SliderNew = 0x33,
    ScrollbarNew = 0x34,
    GaugeNew = 0x35,
    CgCaption = 0x36,
    MediaPlay = 0x37,
    PrevMenuNew = 0x38,
    PropMotion = 0x39,
    FormatHist = 0x3A,
    SaveCabinet = 0x3B,
    LoadCabinet = 0x3C,
    Ifdef = 0x3D,
    Ifndef = 0x3E,
    Endif = 0x3F,
}

impl CommandType {
    pub const ALL: [CommandType; 64] = [
        CommandType::If, CommandType::Elseif, CommandType::Else, CommandType::Label,
        CommandType::Jump, CommandType::Call, CommandType::Exit, CommandType::Wait,
        CommandType::BoxNew, CommandType::ImgNew, CommandType::MesNew, CommandType::Timer,
        CommandType::Movie, CommandType::Flip, CommandType::Calc, CommandType::VarNew,
        CommandType::VarDel, CommandType::GetProp, CommandType::SetProp, CommandType::ObjDel,
        CommandType::TextIns, CommandType::MovieStop, CommandType::ClrHist, CommandType::Cinema,
        CommandType::Caption, CommandType::Menu, CommandType::MenuClose, CommandType::Comment,
        CommandType::TextClr, CommandType::CallHist, CommandType::Button, CommandType::While,
        CommandType::WhileInit, CommandType::WhileLoop, CommandType::Break, CommandType::Continue,
        CommandType::ParticleNew, CommandType::FireNew, CommandType::GameSave,
        CommandType::GameLoad, CommandType::PcReset, CommandType::Reset, CommandType::Sound,
        CommandType::EditNew, CommandType::MemoNew, CommandType::Terminate, CommandType::DoEvent,
        CommandType::ClrRead, CommandType::MapImgNew, CommandType::WaveNew, CommandType::TileNew,
        CommandType::SliderNew, CommandType::ScrollbarNew, CommandType::GaugeNew,
        CommandType::CgCaption, CommandType::MediaPlay, CommandType::PrevMenuNew,
        CommandType::PropMotion, CommandType::FormatHist, CommandType::SaveCabinet,
        CommandType::LoadCabinet, CommandType::Ifdef, CommandType::Ifndef, CommandType::Endif,
    ];

    pub fn from_u8(v: u8) -> Option<CommandType> {
        CommandType::ALL.get(v as usize).copied()
    }

    /// Command name as written in script source.
    pub fn name(self) -> &'static str {
        match self {
            CommandType::If => "If",
            CommandType::Elseif => "Elseif",
            CommandType::Else => "Else",
            CommandType::Label => "Label",
            CommandType::Jump => "Jump",
            CommandType::Call => "Call",
            CommandType::Exit => "Exit",
            CommandType::Wait => "Wait",
            CommandType::BoxNew => "BoxNew",
            CommandType::ImgNew => "ImgNew",
            CommandType::MesNew => "MesNew",
            CommandType::Timer => "Timer",
            CommandType::Movie => "Movie",
            CommandType::Flip => "Flip",
            CommandType::Calc => "Calc",
            CommandType::VarNew => "VarNew",
            CommandType::VarDel => "VarDel",
            CommandType::GetProp => "GetProp",
            CommandType::SetProp => "SetProp",
            CommandType::ObjDel => "ObjDel",
            CommandType::TextIns => "TextIns",
            CommandType::MovieStop => "MovieStop",
            CommandType::ClrHist => "ClrHist",
            CommandType::Cinema => "Cinema",
            CommandType::Caption => "Caption",
            CommandType::Menu => "Menu",
            CommandType::MenuClose => "MenuClose",
            CommandType::Comment => "Comment",
            CommandType::TextClr => "TextClr",
            CommandType::CallHist => "CallHist",
            CommandType::Button => "Button",
            CommandType::While => "While",
            CommandType::WhileInit => "WhileInit",
            CommandType::WhileLoop => "WhileLoop",
            CommandType::Break => "Break",
            CommandType::Continue => "Continue",
            CommandType::ParticleNew => "ParticleNew",
            CommandType::FireNew => "FireNew",
            CommandType::GameSave => "GameSave",
            CommandType::GameLoad => "GameLoad",
            CommandType::PcReset => "PCReset",
            CommandType::Reset => "Reset",
            CommandType::Sound => "Sound",
            CommandType::EditNew => "EditNew",
            CommandType::MemoNew => "MemoNew",
            CommandType::Terminate => "Terminate",
            CommandType::DoEvent => "DoEvent",
            CommandType::ClrRead => "ClrRead",
            CommandType::MapImgNew => "MapImgNew",
            CommandType::WaveNew => "WaveNew",
            CommandType::TileNew => "TileNew",
            CommandType::SliderNew => "SliderNew",
            CommandType::ScrollbarNew => "ScrollbarNew",
            CommandType::GaugeNew => "GaugeNew",
            CommandType::CgCaption => "CGCaption",
            CommandType::MediaPlay => "MediaPlay",
            CommandType::PrevMenuNew => "PrevMenuNew",
            CommandType::PropMotion => "PropMotion",
            CommandType::FormatHist => "FormatHist",
            CommandType::SaveCabinet => "SaveCabinet",
            CommandType::LoadCabinet => "LoadCabinet",
            CommandType::Ifdef => "IFDEF",
            CommandType::Ifndef => "IFNDEF",
            CommandType::Endif => "ENDIF",
        }
    }
}

/// Where a label reference points inside its page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LabelTarget {
    /// Line number of the target `Label` command; 0 is the start of the page.
    Line(u32),
    /// Label name, resolved to a line before serialization.
    Name(String),
}

/// Jump or call target: a page (script file name) and a label in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelReference {
    pub page: String,
    pub label: LabelTarget,
}

impl LabelReference {
    pub fn new(page: &str, line: u32) -> LabelReference {
        LabelReference {
            page: page.to_string(),
            label: LabelTarget::Line(line),
        }
    }

    pub fn line(&self) -> Option<u32> {
        match self.label {
            LabelTarget::Line(l) => Some(l),
            LabelTarget::Name(_) => None,
        }
    }

    fn decode(r: &mut Reader) -> Result<LabelReference> {
        Ok(LabelReference {
            page: r.string()?,
            label: LabelTarget::Line(r.u32()?),
        })
    }

    fn encode(&self, w: &mut Writer, line: u32) -> Result<()> {
        w.string(&self.page)?;
        match &self.label {
            LabelTarget::Line(l) => w.u32(*l),
            LabelTarget::Name(name) => {
                return Err(LsbError::MalformedCommand {
                    line,
                    reason: format!("label '{}' in {} was never resolved to a line", name, self.page),
                })
            }
        }
        Ok(())
    }
}

impl fmt::Display for LabelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            LabelTarget::Line(l) => write!(f, "{}:{}", self.page, l),
            LabelTarget::Name(n) => write!(f, "{}:{}", self.page, n),
        }
    }
}

/// Property slots of a component (object constructor) command.
///
/// Which properties a command carries is declared by the script's
/// parameter table row for its kind, not by the command itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Components {
    pub slots: Vec<(PropertyType, LiveParser)>,
}

impl Components {
    /// Assign values to the properties enabled in `row`, in table order.
    pub fn from_values(values: Vec<LiveParser>, row: &[bool], line: u32) -> Result<Components> {
        let enabled: Vec<usize> = row.iter().enumerate().filter(|(_, f)| **f).map(|(i, _)| i).collect();
        if values.len() > enabled.len() {
            return Err(LsbError::MalformedCommand {
                line,
                reason: format!(
                    "{} component values but the parameter table declares {}",
                    values.len(),
                    enabled.len()
                ),
            });
        }
        Ok(Components {
            slots: enabled.into_iter().map(PropertyType::from_slot).zip(values).collect(),
        })
    }

    pub fn get(&self, prop: PropertyType) -> Option<&LiveParser> {
        self.slots.iter().find(|(p, _)| *p == prop).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, prop: PropertyType) -> Option<&mut LiveParser> {
        self.slots.iter_mut().find(|(p, _)| *p == prop).map(|(_, v)| v)
    }

    /// Object name expression.
    pub fn name(&self) -> Option<&LiveParser> {
        self.get(PropertyType::NAME)
    }

    fn decode(r: &mut Reader, row: &[bool], line: u32) -> Result<Components> {
        let count = row.iter().filter(|f| **f).count();
        let mut values = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            values.push(LiveParser::decode(r)?);
        }
        Components::from_values(values, row, line)
    }

    fn encode(&self, w: &mut Writer, row: &[bool], line: u32) -> Result<()> {
        for (prop, _) in &self.slots {
            let declared = prop.slot().and_then(|s| row.get(s)).copied().unwrap_or(false);
            if !declared {
                return Err(LsbError::MalformedCommand {
                    line,
                    reason: format!("property {} is not declared in the parameter table", prop),
                });
            }
        }
        let empty = LiveParser::default();
        for (slot, _) in row.iter().enumerate().filter(|(_, f)| **f) {
            let value = self.get(PropertyType::from_slot(slot)).unwrap_or(&empty);
            value.encode(w)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Flip {
    pub wipe: LiveParser,
    pub time: LiveParser,
    pub reverse: LiveParser,
    pub act: LiveParser,
    pub targets: Vec<LiveParser>,
    pub delete: LiveParser,
    pub param: [LiveParser; 2],
    pub source: Option<LiveParser>,
    pub stop_event: Option<LiveParser>,
    pub difference_only: Option<LiveParser>,
}

/// Narrative text insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextIns {
    pub text: TpWord,
    pub target: LiveParser,
    pub hist: LiveParser,
    pub wait: LiveParser,
    pub stop_event: Option<LiveParser>,
}

/// Save/load cabinet: component properties plus the affected objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cabinet {
    pub components: Components,
    pub act: LiveParser,
    pub targets: Vec<LiveParser>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CommandKind {
    If { calc: LiveParser },
    Elseif { calc: LiveParser },
    Else,
    Label { name: String },
    Jump { page: LabelReference, calc: LiveParser },
    Call {
        page: LabelReference,
        result: String,
        calc: LiveParser,
        params: Vec<LiveParser>,
    },
    Exit { calc: LiveParser },
    Wait {
        calc: LiveParser,
        time: LiveParser,
        stop_event: Option<LiveParser>,
    },
    BoxNew(Components),
    ImgNew(Components),
    MesNew(Components),
    Timer(Components),
    Movie(Components),
    Flip(Box<Flip>),
    Calc { calc: LiveParser },
    VarNew {
        name: String,
        var_type: ParamType,
        init_val: LiveParser,
        scope: u8,
    },
    VarDel { name: String },
    GetProp {
        obj_name: LiveParser,
        obj_prop: LiveParser,
        var_name: String,
    },
    SetProp {
        obj_name: LiveParser,
        obj_prop: LiveParser,
        value: LiveParser,
    },
    ObjDel { name: LiveParser },
    TextIns(Box<TextIns>),
    MovieStop {
        target: LiveParser,
        time: LiveParser,
        wait: LiveParser,
        stop_event: Option<LiveParser>,
    },
    ClrHist,
    Cinema(Components),
    Caption(Components),
    Menu(Components),
    MenuClose { target: LiveParser },
    Comment { text: String },
    TextClr { target: LiveParser },
    CallHist {
        target: LiveParser,
        index: LiveParser,
        count: LiveParser,
        cut_break: LiveParser,
        format_name: Option<LiveParser>,
    },
    Button(Components),
    /// Loop guard; `end` is the line of the last command inside the loop.
    While { calc: LiveParser, end: u32 },
    WhileInit { calc: LiveParser },
    /// Loop increment; `start` is the line of the matching `While`.
    WhileLoop { calc: LiveParser, start: u32 },
    Break { calc: LiveParser, end: u32 },
    Continue { calc: LiveParser, start: u32 },
    ParticleNew(Components),
    FireNew(Components),
    GameSave {
        no: LiveParser,
        page: String,
        label: Option<u32>,
        caption: LiveParser,
    },
    GameLoad { no: LiveParser },
    PcReset { page: LabelReference, all_clear: u8 },
    Reset { page: LabelReference, all_clear: u8 },
    Sound(Components),
    EditNew(Components),
    MemoNew(Components),
    Terminate,
    DoEvent,
    ClrRead,
    MapImgNew(Components),
    WaveNew(Components),
    TileNew(Components),
    SliderNew(Components),
    ScrollbarNew(Components),
    GaugeNew(Components),
    CgCaption(Components),
    MediaPlay { target: LiveParser },
    PrevMenuNew(Components),
    PropMotion {
        name: LiveParser,
        obj_name: LiveParser,
        obj_prop: LiveParser,
        value: LiveParser,
        time: LiveParser,
        move_type: LiveParser,
        paused: Option<LiveParser>,
    },
    FormatHist {
        name: LiveParser,
        target: Option<LiveParser>,
    },
    SaveCabinet(Cabinet),
    LoadCabinet(Cabinet),
    Ifdef,
    Ifndef,
    Endif,
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        use CommandKind as K;
        match self {
            K::If { .. } => CommandType::If,
            K::Elseif { .. } => CommandType::Elseif,
            K::Else => CommandType::Else,
            K::Label { .. } => CommandType::Label,
            K::Jump { .. } => CommandType::Jump,
            K::Call { .. } => CommandType::Call,
            K::Exit { .. } => CommandType::Exit,
            K::Wait { .. } => CommandType::Wait,
            K::BoxNew(_) => CommandType::BoxNew,
            K::ImgNew(_) => CommandType::ImgNew,
            K::MesNew(_) => CommandType::MesNew,
            K::Timer(_) => CommandType::Timer,
            K::Movie(_) => CommandType::Movie,
            K::Flip(_) => CommandType::Flip,
            K::Calc { .. } => CommandType::Calc,
            K::VarNew { .. } => CommandType::VarNew,
            K::VarDel { .. } => CommandType::VarDel,
            K::GetProp { .. } => CommandType::GetProp,
            K::SetProp { .. } => CommandType::SetProp,
            K::ObjDel { .. } => CommandType::ObjDel,
            K::TextIns(_) => CommandType::TextIns,
            K::MovieStop { .. } => CommandType::MovieStop,
            K::ClrHist => CommandType::ClrHist,
            K::Cinema(_) => CommandType::Cinema,
            K::Caption(_) => CommandType::Caption,
            K::Menu(_) => CommandType::Menu,
            K::MenuClose { .. } => CommandType::MenuClose,
            K::Comment { .. } => CommandType::Comment,
            K::TextClr { .. } => CommandType::TextClr,
            K::CallHist { .. } => CommandType::CallHist,
            K::Button(_) => CommandType::Button,
            K::While { .. } => CommandType::While,
            K::WhileInit { .. } => CommandType::WhileInit,
            K::WhileLoop { .. } => CommandType::WhileLoop,
            K::Break { .. } => CommandType::Break,
            K::Continue { .. } => CommandType::Continue,
            K::ParticleNew(_) => CommandType::ParticleNew,
            K::FireNew(_) => CommandType::FireNew,
            K::GameSave { .. } => CommandType::GameSave,
            K::GameLoad { .. } => CommandType::GameLoad,
            K::PcReset { .. } => CommandType::PcReset,
            K::Reset { .. } => CommandType::Reset,
            K::Sound(_) => CommandType::Sound,
            K::EditNew(_) => CommandType::EditNew,
            K::MemoNew(_) => CommandType::MemoNew,
            K::Terminate => CommandType::Terminate,
            K::DoEvent => CommandType::DoEvent,
            K::ClrRead => CommandType::ClrRead,
            K::MapImgNew(_) => CommandType::MapImgNew,
            K::WaveNew(_) => CommandType::WaveNew,
            K::TileNew(_) => CommandType::TileNew,
            K::SliderNew(_) => CommandType::SliderNew,
            K::ScrollbarNew(_) => CommandType::ScrollbarNew,
            K::GaugeNew(_) => CommandType::GaugeNew,
            K::CgCaption(_) => CommandType::CgCaption,
            K::MediaPlay { .. } => CommandType::MediaPlay,
            K::PrevMenuNew(_) => CommandType::PrevMenuNew,
            K::PropMotion { .. } => CommandType::PropMotion,
            K::FormatHist { .. } => CommandType::FormatHist,
            K::SaveCabinet(_) => CommandType::SaveCabinet,
            K::LoadCabinet(_) => CommandType::LoadCabinet,
            K::Ifdef => CommandType::Ifdef,
            K::Ifndef => CommandType::Ifndef,
            K::Endif => CommandType::Endif,
        }
    }

    /// Property slots, for component and cabinet commands.
    pub fn components(&self) -> Option<&Components> {
        use CommandKind as K;
        match self {
            K::BoxNew(c) | K::ImgNew(c) | K::MesNew(c) | K::Timer(c) | K::Movie(c) | K::Cinema(c)
            | K::Caption(c) | K::Menu(c) | K::Button(c) | K::ParticleNew(c) | K::FireNew(c)
            | K::Sound(c) | K::EditNew(c) | K::MemoNew(c) | K::MapImgNew(c) | K::WaveNew(c)
            | K::TileNew(c) | K::SliderNew(c) | K::ScrollbarNew(c) | K::GaugeNew(c)
            | K::CgCaption(c) | K::PrevMenuNew(c) => Some(c),
            K::SaveCabinet(cab) | K::LoadCabinet(cab) => Some(&cab.components),
            _ => None,
        }
    }

    fn components_mut(&mut self) -> Option<&mut Components> {
        use CommandKind as K;
        match self {
            K::BoxNew(c) | K::ImgNew(c) | K::MesNew(c) | K::Timer(c) | K::Movie(c) | K::Cinema(c)
            | K::Caption(c) | K::Menu(c) | K::Button(c) | K::ParticleNew(c) | K::FireNew(c)
            | K::Sound(c) | K::EditNew(c) | K::MemoNew(c) | K::MapImgNew(c) | K::WaveNew(c)
            | K::TileNew(c) | K::SliderNew(c) | K::ScrollbarNew(c) | K::GaugeNew(c)
            | K::CgCaption(c) | K::PrevMenuNew(c) => Some(c),
            K::SaveCabinet(cab) | K::LoadCabinet(cab) => Some(&mut cab.components),
            _ => None,
        }
    }

    /// Guard or assignment expression, for the kinds that carry one.
    pub fn calc(&self) -> Option<&LiveParser> {
        use CommandKind as K;
        match self {
            K::If { calc }
            | K::Elseif { calc }
            | K::Jump { calc, .. }
            | K::Call { calc, .. }
            | K::Exit { calc }
            | K::Wait { calc, .. }
            | K::Calc { calc }
            | K::While { calc, .. }
            | K::WhileInit { calc }
            | K::WhileLoop { calc, .. }
            | K::Break { calc, .. }
            | K::Continue { calc, .. } => Some(calc),
            _ => None,
        }
    }

    pub fn calc_mut(&mut self) -> Option<&mut LiveParser> {
        use CommandKind as K;
        match self {
            K::If { calc }
            | K::Elseif { calc }
            | K::Jump { calc, .. }
            | K::Call { calc, .. }
            | K::Exit { calc }
            | K::Wait { calc, .. }
            | K::Calc { calc }
            | K::While { calc, .. }
            | K::WhileInit { calc }
            | K::WhileLoop { calc, .. }
            | K::Break { calc, .. }
            | K::Continue { calc, .. } => Some(calc),
            _ => None,
        }
    }

    /// Jump, call or reset target.
    pub fn target_page(&self) -> Option<&LabelReference> {
        match self {
            CommandKind::Jump { page, .. }
            | CommandKind::Call { page, .. }
            | CommandKind::PcReset { page, .. }
            | CommandKind::Reset { page, .. } => Some(page),
            _ => None,
        }
    }

    fn target_page_mut(&mut self) -> Option<&mut LabelReference> {
        match self {
            CommandKind::Jump { page, .. }
            | CommandKind::Call { page, .. }
            | CommandKind::PcReset { page, .. }
            | CommandKind::Reset { page, .. } => Some(page),
            _ => None,
        }
    }
}

/// One script command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Nesting depth; scopes `If` and `While` blocks.
    pub indent: u32,
    /// Soft-disabled.
    pub mute: bool,
    pub not_update: bool,
    /// Source line; the only stable cross-reference for jump targets.
    pub line_no: u32,
    pub kind: CommandKind,
}

fn lp(r: &mut Reader) -> Result<LiveParser> {
    LiveParser::decode(r)
}

fn lp_since(r: &mut Reader, version: u32, since: u32) -> Result<Option<LiveParser>> {
    r.read_if(version >= since, LiveParser::decode)
}

fn put_since(w: &mut Writer, version: u32, since: u32, value: &Option<LiveParser>) -> Result<()> {
    w.write_if(version >= since, value, |w, v| v.encode(w))
}

impl Command {
    pub fn new(line_no: u32, indent: u32, kind: CommandKind) -> Command {
        Command {
            indent,
            mute: false,
            not_update: false,
            line_no,
            kind,
        }
    }

    pub fn command_type(&self) -> CommandType {
        self.kind.command_type()
    }

    pub fn components_mut(&mut self) -> Option<&mut Components> {
        self.kind.components_mut()
    }

    pub fn target_page_mut(&mut self) -> Option<&mut LabelReference> {
        self.kind.target_page_mut()
    }

    /// Decode one command. `row` is the parameter table row for the command's
    /// kind and is only consulted by component commands.
    pub(crate) fn decode(r: &mut Reader, version: u32, table: &[Vec<bool>]) -> Result<Command> {
        let offset = r.position();
        let tag = r.u8()?;
        let ty = CommandType::from_u8(tag).ok_or(LsbError::InvalidTag {
            what: "command type",
            value: u32::from(tag),
            offset,
        })?;
        let indent = r.u32()?;
        let mute = r.flag()?;
        let not_update = r.flag()?;
        let line = r.u32()?;
        let row = table.get(ty as usize).map(Vec::as_slice).unwrap_or(&[]);
        let comps = |r: &mut Reader| Components::decode(r, row, line);
        use CommandKind as K;
        let kind = match ty {
            CommandType::If => K::If { calc: lp(r)? },
            CommandType::Elseif => K::Elseif { calc: lp(r)? },
            CommandType::Else => K::Else,
            CommandType::Label => K::Label { name: r.string()? },
            CommandType::Jump => K::Jump {
                page: LabelReference::decode(r)?,
                calc: lp(r)?,
            },
            CommandType::Call => K::Call {
                page: LabelReference::decode(r)?,
                result: r.string()?,
                calc: lp(r)?,
                params: LiveParser::decode_array(r)?,
            },
            CommandType::Exit => K::Exit { calc: lp(r)? },
            CommandType::Wait => K::Wait {
                calc: lp(r)?,
                time: lp(r)?,
                stop_event: lp_since(r, version, STOP_EVENT_SINCE)?,
            },
            CommandType::BoxNew => K::BoxNew(comps(r)?),
            CommandType::ImgNew => K::ImgNew(comps(r)?),
            CommandType::MesNew => K::MesNew(comps(r)?),
            CommandType::Timer => K::Timer(comps(r)?),
            CommandType::Movie => K::Movie(comps(r)?),
            CommandType::Flip => K::Flip(Box::new(Flip {
                wipe: lp(r)?,
                time: lp(r)?,
                reverse: lp(r)?,
                act: lp(r)?,
                targets: LiveParser::decode_array(r)?,
                delete: lp(r)?,
                param: [lp(r)?, lp(r)?],
                source: lp_since(r, version, FLIP_SOURCE_SINCE)?,
                stop_event: lp_since(r, version, STOP_EVENT_SINCE)?,
                difference_only: lp_since(r, version, DIFFERENCE_ONLY_SINCE)?,
            })),
            CommandType::Calc => K::Calc { calc: lp(r)? },
            CommandType::VarNew => {
                let name = r.string()?;
                let at = r.position();
                let tag = r.u8()?;
                let var_type = ParamType::from_u8(tag).ok_or(LsbError::InvalidTag {
                    what: "variable type",
                    value: u32::from(tag),
                    offset: at,
                })?;
                K::VarNew {
                    name,
                    var_type,
                    init_val: lp(r)?,
                    scope: r.u8()?,
                }
            }
            CommandType::VarDel => K::VarDel { name: r.string()? },
            CommandType::GetProp => K::GetProp {
                obj_name: lp(r)?,
                obj_prop: lp(r)?,
                var_name: r.string()?,
            },
            CommandType::SetProp => K::SetProp {
                obj_name: lp(r)?,
                obj_prop: lp(r)?,
                value: lp(r)?,
            },
            CommandType::ObjDel => K::ObjDel { name: lp(r)? },
            CommandType::TextIns => {
                let len = r.u32()? as usize;
                let text = TpWord::parse(r.take(len)?)?;
                K::TextIns(Box::new(TextIns {
                    text,
                    target: lp(r)?,
                    hist: lp(r)?,
                    wait: lp(r)?,
                    stop_event: lp_since(r, version, STOP_EVENT_SINCE)?,
                }))
            }
            CommandType::MovieStop => K::MovieStop {
                target: lp(r)?,
                time: lp(r)?,
                wait: lp(r)?,
                stop_event: lp_since(r, version, STOP_EVENT_SINCE)?,
            },
            CommandType::ClrHist => K::ClrHist,
            CommandType::Cinema => K::Cinema(comps(r)?),
            CommandType::Caption => K::Caption(comps(r)?),
            CommandType::Menu => K::Menu(comps(r)?),
            CommandType::MenuClose => K::MenuClose { target: lp(r)? },
            CommandType::Comment => K::Comment { text: r.string()? },
            CommandType::TextClr => K::TextClr { target: lp(r)? },
            CommandType::CallHist => K::CallHist {
                target: lp(r)?,
                index: lp(r)?,
                count: lp(r)?,
                cut_break: lp(r)?,
                format_name: lp_since(r, version, FORMAT_NAME_SINCE)?,
            },
            CommandType::Button => K::Button(comps(r)?),
            CommandType::While => K::While {
                calc: lp(r)?,
                end: r.u32()?,
            },
            CommandType::WhileInit => K::WhileInit { calc: lp(r)? },
            CommandType::WhileLoop => K::WhileLoop {
                calc: lp(r)?,
                start: r.u32()?,
            },
            CommandType::Break => K::Break {
                calc: lp(r)?,
                end: r.u32()?,
            },
            CommandType::Continue => K::Continue {
                calc: lp(r)?,
                start: r.u32()?,
            },
            CommandType::ParticleNew => K::ParticleNew(comps(r)?),
            CommandType::FireNew => K::FireNew(comps(r)?),
            CommandType::GameSave => K::GameSave {
                no: lp(r)?,
                page: r.string()?,
                label: r.read_if(version >= SAVE_LABEL_SINCE, |r| r.u32())?,
                caption: lp(r)?,
            },
            CommandType::GameLoad => K::GameLoad { no: lp(r)? },
            CommandType::PcReset => K::PcReset {
                page: LabelReference::decode(r)?,
                all_clear: r.u8()?,
            },
            CommandType::Reset => K::Reset {
                page: LabelReference::decode(r)?,
                all_clear: r.u8()?,
            },
            CommandType::Sound => K::Sound(comps(r)?),
            CommandType::EditNew => K::EditNew(comps(r)?),
            CommandType::MemoNew => K::MemoNew(comps(r)?),
            CommandType::Terminate => K::Terminate,
            CommandType::DoEvent => K::DoEvent,
            CommandType::ClrRead => K::ClrRead,
            CommandType::MapImgNew => K::MapImgNew(comps(r)?),
            CommandType::WaveNew => K::WaveNew(comps(r)?),
            CommandType::TileNew => K::TileNew(comps(r)?),
            CommandType::SliderNew => K::SliderNew(comps(r)?),
            CommandType::ScrollbarNew => K::ScrollbarNew(comps(r)?),
            CommandType::GaugeNew => K::GaugeNew(comps(r)?),
            CommandType::CgCaption => K::CgCaption(comps(r)?),
            CommandType::MediaPlay => K::MediaPlay { target: lp(r)? },
            CommandType::PrevMenuNew => K::PrevMenuNew(comps(r)?),
            CommandType::PropMotion => K::PropMotion {
                name: lp(r)?,
                obj_name: lp(r)?,
                obj_prop: lp(r)?,
                value: lp(r)?,
                time: lp(r)?,
                move_type: lp(r)?,
                paused: lp_since(r, version, PAUSED_SINCE)?,
            },
            CommandType::FormatHist => K::FormatHist {
                name: lp(r)?,
                target: lp_since(r, version, FORMAT_NAME_SINCE)?,
            },
            CommandType::SaveCabinet | CommandType::LoadCabinet => {
                let cab = Cabinet {
                    components: comps(r)?,
                    act: lp(r)?,
                    targets: LiveParser::decode_array(r)?,
                };
                if ty == CommandType::SaveCabinet {
                    K::SaveCabinet(cab)
                } else {
                    K::LoadCabinet(cab)
                }
            }
            CommandType::Ifdef => K::Ifdef,
            CommandType::Ifndef => K::Ifndef,
            CommandType::Endif => K::Endif,
        };
        Ok(Command {
            indent,
            mute,
            not_update,
            line_no: line,
            kind,
        })
    }

    pub(crate) fn encode(&self, w: &mut Writer, version: u32, table: &[Vec<bool>]) -> Result<()> {
        let ty = self.command_type();
        let line = self.line_no;
        w.u8(ty as u8);
        w.u32(self.indent);
        w.flag(self.mute);
        w.flag(self.not_update);
        w.u32(line);
        let row = table.get(ty as usize).map(Vec::as_slice).unwrap_or(&[]);
        use CommandKind as K;
        match &self.kind {
            K::Else | K::ClrHist | K::Terminate | K::DoEvent | K::ClrRead | K::Ifdef | K::Ifndef | K::Endif => {}
            K::If { calc }
            | K::Elseif { calc }
            | K::Exit { calc }
            | K::Calc { calc }
            | K::WhileInit { calc } => calc.encode(w)?,
            K::Label { name } | K::VarDel { name } => w.string(name)?,
            K::Comment { text } => w.string(text)?,
            K::Jump { page, calc } => {
                page.encode(w, line)?;
                calc.encode(w)?;
            }
            K::Call {
                page,
                result,
                calc,
                params,
            } => {
                page.encode(w, line)?;
                w.string(result)?;
                calc.encode(w)?;
                LiveParser::encode_array(w, params)?;
            }
            K::Wait { calc, time, stop_event } => {
                calc.encode(w)?;
                time.encode(w)?;
                put_since(w, version, STOP_EVENT_SINCE, stop_event)?;
            }
            K::Flip(f) => {
                for v in [&f.wipe, &f.time, &f.reverse, &f.act] {
                    v.encode(w)?;
                }
                LiveParser::encode_array(w, &f.targets)?;
                f.delete.encode(w)?;
                f.param[0].encode(w)?;
                f.param[1].encode(w)?;
                put_since(w, version, FLIP_SOURCE_SINCE, &f.source)?;
                put_since(w, version, STOP_EVENT_SINCE, &f.stop_event)?;
                put_since(w, version, DIFFERENCE_ONLY_SINCE, &f.difference_only)?;
            }
            K::VarNew {
                name,
                var_type,
                init_val,
                scope,
            } => {
                w.string(name)?;
                w.u8(*var_type as u8);
                init_val.encode(w)?;
                w.u8(*scope);
            }
            K::GetProp {
                obj_name,
                obj_prop,
                var_name,
            } => {
                obj_name.encode(w)?;
                obj_prop.encode(w)?;
                w.string(var_name)?;
            }
            K::SetProp {
                obj_name,
                obj_prop,
                value,
            } => {
                for v in [obj_name, obj_prop, value] {
                    v.encode(w)?;
                }
            }
            K::ObjDel { name } => name.encode(w)?,
            K::TextIns(t) => {
                let text = t.text.to_bytes()?;
                w.count(text.len());
                w.bytes(&text);
                for v in [&t.target, &t.hist, &t.wait] {
                    v.encode(w)?;
                }
                put_since(w, version, STOP_EVENT_SINCE, &t.stop_event)?;
            }
            K::MovieStop {
                target,
                time,
                wait,
                stop_event,
            } => {
                for v in [target, time, wait] {
                    v.encode(w)?;
                }
                put_since(w, version, STOP_EVENT_SINCE, stop_event)?;
            }
            K::MenuClose { target } | K::TextClr { target } | K::MediaPlay { target } => target.encode(w)?,
            K::CallHist {
                target,
                index,
                count,
                cut_break,
                format_name,
            } => {
                for v in [target, index, count, cut_break] {
                    v.encode(w)?;
                }
                put_since(w, version, FORMAT_NAME_SINCE, format_name)?;
            }
            K::While { calc, end } | K::Break { calc, end } => {
                calc.encode(w)?;
                w.u32(*end);
            }
            K::WhileLoop { calc, start } | K::Continue { calc, start } => {
                calc.encode(w)?;
                w.u32(*start);
            }
            K::GameSave {
                no,
                page,
                label,
                caption,
            } => {
                no.encode(w)?;
                w.string(page)?;
                w.write_if(version >= SAVE_LABEL_SINCE, label, |w, l| {
                    w.u32(*l);
                    Ok(())
                })?;
                caption.encode(w)?;
            }
            K::GameLoad { no } => no.encode(w)?,
            K::PcReset { page, all_clear } | K::Reset { page, all_clear } => {
                page.encode(w, line)?;
                w.u8(*all_clear);
            }
            K::PropMotion {
                name,
                obj_name,
                obj_prop,
                value,
                time,
                move_type,
                paused,
            } => {
                for v in [name, obj_name, obj_prop, value, time, move_type] {
                    v.encode(w)?;
                }
                put_since(w, version, PAUSED_SINCE, paused)?;
            }
            K::FormatHist { name, target } => {
                name.encode(w)?;
                put_since(w, version, FORMAT_NAME_SINCE, target)?;
            }
            K::SaveCabinet(cab) | K::LoadCabinet(cab) => {
                cab.components.encode(w, row, line)?;
                cab.act.encode(w)?;
                LiveParser::encode_array(w, &cab.targets)?;
            }
            K::BoxNew(c) | K::ImgNew(c) | K::MesNew(c) | K::Timer(c) | K::Movie(c) | K::Cinema(c)
            | K::Caption(c) | K::Menu(c) | K::Button(c) | K::ParticleNew(c) | K::FireNew(c)
            | K::Sound(c) | K::EditNew(c) | K::MemoNew(c) | K::MapImgNew(c) | K::WaveNew(c)
            | K::TileNew(c) | K::SliderNew(c) | K::ScrollbarNew(c) | K::GaugeNew(c)
            | K::CgCaption(c) | K::PrevMenuNew(c) => c.encode(w, row, line)?,
        }
        Ok(())
    }
}

fn expr(lp: &LiveParser) -> String {
    lp.render().unwrap_or_else(|e| format!("<{}>", e))
}

impl fmt::Display for Command {
    /// One-line source-like summary: `line indent Name fields`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>5} ", self.line_no)?;
        if self.mute {
            f.write_str("//")?;
        }
        write!(f, "{:width$}{}", "", self.command_type().name(), width = self.indent as usize * 2)?;
        use CommandKind as K;
        match &self.kind {
            K::Label { name } | K::VarDel { name } => write!(f, " {}", name),
            K::Comment { text } => write!(f, " {}", text),
            K::Jump { page, calc } => write!(f, " {} if {}", page, expr(calc)),
            K::Call { page, result, params, .. } => {
                write!(f, " {}", page)?;
                for p in params {
                    write!(f, " {}", expr(p))?;
                }
                if !result.is_empty() {
                    write!(f, " -> {}", result)?;
                }
                Ok(())
            }
            K::PcReset { page, .. } | K::Reset { page, .. } => write!(f, " {}", page),
            K::While { calc, end } | K::Break { calc, end } => write!(f, " {} (end {})", expr(calc), end),
            K::WhileLoop { calc, start } | K::Continue { calc, start } => {
                write!(f, " {} (start {})", expr(calc), start)
            }
            K::VarNew {
                name,
                var_type,
                init_val,
                ..
            } => write!(f, " {}: {:?} = {}", name, var_type, expr(init_val)),
            K::TextIns(t) => {
                let chars: String = t.text.body().iter().filter_map(|g| g.as_char()).take(24).collect();
                write!(f, " {:?}", chars)
            }
            K::GetProp {
                obj_name,
                obj_prop,
                var_name,
            } => write!(f, " {} = {}.{}", var_name, expr(obj_name), expr(obj_prop)),
            K::SetProp {
                obj_name,
                obj_prop,
                value,
            } => write!(f, " {}.{} = {}", expr(obj_name), expr(obj_prop), expr(value)),
            other => {
                if let Some(calc) = other.calc() {
                    write!(f, " {}", expr(calc))?;
                }
                if let Some(comps) = other.components() {
                    for (prop, value) in &comps.slots {
                        if !value.is_empty() {
                            write!(f, " {}={}", prop, expr(value))?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, CommandKind, CommandType, Components, LabelReference, LabelTarget, TextIns};
    use crate::codec::{Reader, Writer};
    use crate::expr::{LiveParser, Param};
    use crate::novel::tests::{ch, sample};
    use crate::property::PropertyType;
    use crate::LsbError;

    fn table_with(ty: CommandType, row: Vec<bool>) -> Vec<Vec<bool>> {
        let mut table = vec![Vec::new(); CommandType::ALL.len()];
        table[ty as usize] = row;
        table
    }

    fn encode(cmd: &Command, version: u32, table: &[Vec<bool>]) -> crate::Result<Vec<u8>> {
        let mut w = Writer::new();
        cmd.encode(&mut w, version, table)?;
        Ok(w.into_inner())
    }

    fn decode(bytes: &[u8], version: u32, table: &[Vec<bool>]) -> crate::Result<Command> {
        let mut r = Reader::new(bytes);
        let cmd = Command::decode(&mut r, version, table)?;
        assert_eq!(r.remaining(), 0);
        Ok(cmd)
    }

    fn wait(stop_event: Option<LiveParser>) -> Command {
        Command::new(
            3,
            0,
            CommandKind::Wait {
                calc: LiveParser::from_value(Param::from(true)),
                time: LiveParser::from_value(Param::from(500)),
                stop_event,
            },
        )
    }

    #[test]
    fn command_types_are_consecutive() {
        for (i, ty) in CommandType::ALL.iter().enumerate() {
            assert_eq!(*ty as usize, i);
            assert_eq!(CommandType::from_u8(i as u8), Some(*ty));
        }
        assert_eq!(CommandType::from_u8(CommandType::ALL.len() as u8), None);
        assert_eq!(CommandType::PcReset.name(), "PCReset");
    }

    #[test]
    fn stop_event_is_version_gated() {
        let table = table_with(CommandType::Wait, Vec::new());
        let old = encode(&wait(None), 106, &table).unwrap();
        let new = encode(&wait(None), 107, &table).unwrap();
        // an empty expression is a bare zero count
        assert_eq!(new.len(), old.len() + 4);

        let parsed = decode(&old, 106, &table).unwrap();
        assert!(matches!(parsed.kind, CommandKind::Wait { stop_event: None, .. }));
        let parsed = decode(&new, 107, &table).unwrap();
        match parsed.kind {
            CommandKind::Wait { stop_event: Some(ev), .. } => assert!(ev.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn header_fields_round_trip() {
        let table = table_with(CommandType::Calc, Vec::new());
        let mut cmd = Command::new(
            42,
            2,
            CommandKind::Calc {
                calc: LiveParser::from_value(Param::from(1)),
            },
        );
        cmd.mute = true;
        let bytes = encode(&cmd, 117, &table).unwrap();
        assert_eq!(&bytes[..11], &[0x0E, 2, 0, 0, 0, 1, 0, 42, 0, 0, 0]);
        assert_eq!(decode(&bytes, 117, &table).unwrap(), cmd);
    }

    #[test]
    fn components_follow_parameter_table() {
        let table = table_with(CommandType::BoxNew, vec![true, false, true]);
        let comps = Components::from_values(
            vec![
                LiveParser::from_value(Param::from("box")),
                LiveParser::from_value(Param::from(7)),
            ],
            &table[CommandType::BoxNew as usize],
            10,
        )
        .unwrap();
        assert_eq!(comps.slots[0].0, PropertyType::NAME);
        assert_eq!(comps.slots[1].0, PropertyType(3));
        let cmd = Command::new(10, 0, CommandKind::BoxNew(comps));
        let bytes = encode(&cmd, 117, &table).unwrap();
        let parsed = decode(&bytes, 117, &table).unwrap();
        assert_eq!(parsed, cmd);
        let name = parsed.kind.components().and_then(Components::name).unwrap();
        assert_eq!(name.literal(), Some(Param::from("box")));
    }

    #[test]
    fn missing_component_values_are_written_empty() {
        let table = table_with(CommandType::ImgNew, vec![true, true]);
        let cmd = Command::new(
            1,
            0,
            CommandKind::ImgNew(Components {
                slots: vec![(PropertyType(2), LiveParser::from_value(Param::from(1)))],
            }),
        );
        let parsed = decode(&encode(&cmd, 117, &table).unwrap(), 117, &table).unwrap();
        let comps = parsed.kind.components().unwrap();
        assert_eq!(comps.slots.len(), 2);
        assert!(comps.name().unwrap().is_empty());
    }

    #[test]
    fn undeclared_component_property_is_rejected() {
        let table = table_with(CommandType::Sound, vec![true]);
        let cmd = Command::new(
            8,
            0,
            CommandKind::Sound(Components {
                slots: vec![(PropertyType(5), LiveParser::default())],
            }),
        );
        assert!(matches!(
            encode(&cmd, 117, &table),
            Err(LsbError::MalformedCommand { line: 8, .. })
        ));
        assert!(matches!(
            Components::from_values(vec![LiveParser::default(); 2], &[true], 9),
            Err(LsbError::MalformedCommand { line: 9, .. })
        ));
    }

    #[test]
    fn unresolved_label_name_cannot_be_written() {
        let table = table_with(CommandType::Jump, Vec::new());
        let cmd = Command::new(
            5,
            0,
            CommandKind::Jump {
                page: LabelReference {
                    page: "00000001.lsb".to_string(),
                    label: LabelTarget::Name("start".to_string()),
                },
                calc: LiveParser::from_value(Param::from(true)),
            },
        );
        assert!(matches!(
            encode(&cmd, 117, &table),
            Err(LsbError::MalformedCommand { line: 5, .. })
        ));
    }

    #[test]
    fn unknown_command_type_is_rejected() {
        let bytes = [0x40, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0];
        assert!(matches!(
            decode(&bytes, 117, &[]),
            Err(LsbError::InvalidTag { value: 0x40, offset: 0, .. })
        ));
    }

    #[test]
    fn text_insertion_embeds_length_prefixed_block() {
        let table = table_with(CommandType::TextIns, Vec::new());
        let text = sample(vec![ch('や'), ch('あ')]);
        let cmd = Command::new(
            7,
            1,
            CommandKind::TextIns(Box::new(TextIns {
                text: text.clone(),
                target: LiveParser::from_value(Param::from("メッセージボックス")),
                hist: LiveParser::default(),
                wait: LiveParser::default(),
                stop_event: Some(LiveParser::default()),
            })),
        );
        let bytes = encode(&cmd, 117, &table).unwrap();
        let block = text.to_bytes().unwrap();
        assert_eq!(&bytes[11..15], &(block.len() as u32).to_le_bytes());
        assert_eq!(&bytes[15..15 + block.len()], block.as_slice());
        let parsed = decode(&bytes, 117, &table).unwrap();
        match &parsed.kind {
            CommandKind::TextIns(t) => assert_eq!(t.text.body(), text.body()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(parsed.to_string().contains("\"やあ\""));
    }

    #[test]
    fn displays_jump_target() {
        let cmd = Command::new(
            12,
            1,
            CommandKind::Jump {
                page: LabelReference::new("00000002.lsb", 4),
                calc: LiveParser::from_value(Param::from(true)),
            },
        );
        assert_eq!(cmd.to_string(), "   12   Jump 00000002.lsb:4 if 1");
    }
}
