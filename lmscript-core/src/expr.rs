//! Calc expressions: tagged operands, single-assignment operator entries and
//! the `LiveParser` chains that bind them together.

use log::warn;
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::codec::{Reader, Writer};
use crate::{LsbError, Result};

/// Name bound by the final entry of an argument expression.
pub const ARG_NAME: &str = "____arg";
/// Prefix of compiler generated temporaries.
pub const TEMP_PREFIX: &str = "____";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ParamType {
    Var = 0x00,
    Int = 0x01,
    Float = 0x02,
    Flag = 0x03,
    Str = 0x04,
}

impl ParamType {
    pub fn from_u8(v: u8) -> Option<ParamType> {
        match v {
            0x00 => Some(ParamType::Var),
            0x01 => Some(ParamType::Int),
            0x02 => Some(ParamType::Float),
            0x03 => Some(ParamType::Flag),
            0x04 => Some(ParamType::Str),
            _ => None,
        }
    }
}

/// 80-bit x87 extended float, kept as its raw little-endian bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extended(pub [u8; 10]);

impl Extended {
    pub fn from_f64(v: f64) -> Extended {
        let bits = v.to_bits();
        let sign = ((bits >> 63) as u16) << 15;
        let exp = ((bits >> 52) & 0x7FF) as i32;
        let frac = bits & ((1u64 << 52) - 1);
        let (exp80, mant) = if exp == 0 && frac == 0 {
            (0u16, 0u64)
        } else if exp == 0x7FF {
            (0x7FFF, (1u64 << 63) | (frac << 11))
        } else if exp == 0 {
            // subnormal: normalise so the explicit integer bit is set
            let shift = frac.leading_zeros() as i32;
            let mant = frac << shift;
            ((-1022 + 16383 - (shift - 11)) as u16, mant)
        } else {
            ((exp - 1023 + 16383) as u16, (1u64 << 63) | (frac << 11))
        };
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&mant.to_le_bytes());
        out[8..].copy_from_slice(&(sign | exp80).to_le_bytes());
        Extended(out)
    }

    pub fn to_f64(self) -> f64 {
        let b = self.0;
        let mant = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        let se = u16::from_le_bytes([b[8], b[9]]);
        let negative = se & 0x8000 != 0;
        let exp = i32::from(se & 0x7FFF);
        let value = if exp == 0 && mant == 0 {
            0.0
        } else if exp == 0x7FFF {
            if mant << 1 == 0 {
                f64::INFINITY
            } else {
                f64::NAN
            }
        } else {
            ldexp(mant as f64 / 2f64.powi(63), exp - 16383)
        };
        if negative {
            -value
        } else {
            value
        }
    }
}

fn ldexp(mut x: f64, mut e: i32) -> f64 {
    while e != 0 && x != 0.0 && x.is_finite() {
        let step = e.clamp(-1000, 1000);
        x *= 2f64.powi(step);
        e -= step;
    }
    x
}

impl fmt::Debug for Extended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extended({:?})", self.to_f64())
    }
}

impl Serialize for Extended {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_f64(self.to_f64())
    }
}

/// Expression operand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum Param {
    Var(String),
    Int(i32),
    Float(Extended),
    Flag(u8),
    Str(String),
}

impl Param {
    /// Build an operand from its textual value.
    ///
    /// `hint` always wins. Without one, integers become `Int`, other numbers
    /// `Float` and everything else `Str`; a variable reference or a flag can
    /// only be produced with an explicit hint.
    pub fn infer(value: &str, hint: Option<ParamType>) -> Result<Param> {
        let bad = |ty: &str| LsbError::Unsupported(format!("'{}' is not a valid {} value", value, ty));
        match hint {
            Some(ParamType::Var) => Ok(Param::Var(value.to_string())),
            Some(ParamType::Str) => Ok(Param::Str(value.to_string())),
            Some(ParamType::Int) => value.trim().parse().map(Param::Int).map_err(|_| bad("Int")),
            Some(ParamType::Float) => value
                .trim()
                .parse::<f64>()
                .map(|v| Param::Float(Extended::from_f64(v)))
                .map_err(|_| bad("Float")),
            Some(ParamType::Flag) => match value.trim() {
                "true" | "True" => Ok(Param::Flag(1)),
                "false" | "False" => Ok(Param::Flag(0)),
                other => other.parse().map(Param::Flag).map_err(|_| bad("Flag")),
            },
            None => {
                if let Ok(v) = value.parse::<i32>() {
                    Ok(Param::Int(v))
                } else if let Ok(v) = value.parse::<f64>() {
                    Ok(Param::Float(Extended::from_f64(v)))
                } else {
                    Ok(Param::Str(value.to_string()))
                }
            }
        }
    }

    pub fn param_type(&self) -> ParamType {
        match self {
            Param::Var(_) => ParamType::Var,
            Param::Int(_) => ParamType::Int,
            Param::Float(_) => ParamType::Float,
            Param::Flag(_) => ParamType::Flag,
            Param::Str(_) => ParamType::Str,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Param::Var(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Script source form: string literals are quoted.
    pub fn to_lsc(&self) -> String {
        match self {
            Param::Str(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Param> {
        let offset = r.position();
        let tag = r.u8()?;
        let ty = ParamType::from_u8(tag).ok_or(LsbError::InvalidTag {
            what: "param type",
            value: u32::from(tag),
            offset,
        })?;
        Ok(match ty {
            ParamType::Var => Param::Var(r.string()?),
            ParamType::Int => Param::Int(r.i32()?),
            ParamType::Float => {
                let mut raw = [0u8; 10];
                raw.copy_from_slice(r.take(10)?);
                Param::Float(Extended(raw))
            }
            ParamType::Flag => Param::Flag(r.u8()?),
            ParamType::Str => Param::Str(r.string()?),
        })
    }

    pub(crate) fn encode(&self, w: &mut Writer) -> Result<()> {
        w.u8(self.param_type() as u8);
        match self {
            Param::Var(s) | Param::Str(s) => w.string(s)?,
            Param::Int(v) => w.i32(*v),
            Param::Float(e) => w.bytes(&e.0),
            Param::Flag(v) => w.u8(*v),
        }
        Ok(())
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Var(s) | Param::Str(s) => f.write_str(s),
            Param::Int(v) => write!(f, "{}", v),
            Param::Float(e) => write!(f, "{:?}", e.to_f64()),
            Param::Flag(v) => write!(f, "{}", v),
        }
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Param {
        Param::Int(v)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Param {
        Param::Float(Extended::from_f64(v))
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Param {
        Param::Flag(u8::from(v))
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Param {
        Param::Str(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpeDataType {
    None = 0x00,
    To = 0x01,
    Plus = 0x02,
    Minus = 0x03,
    Mul = 0x04,
    Div = 0x05,
    Mod = 0x06,
    Or = 0x07,
    And = 0x08,
    Xor = 0x09,
    DimTo = 0x0A,
    Func = 0x0B,
    Equal = 0x0C,
    Big = 0x0D,
    Small = 0x0E,
    EBig = 0x0F,
    ESmall = 0x10,
    ShiftL = 0x11,
    ShiftR = 0x12,
    ComboStr = 0x13,
    NEqual = 0x14,
}

impl OpeDataType {
    pub fn from_u8(v: u8) -> Option<OpeDataType> {
        use OpeDataType::*;
        const ALL: [OpeDataType; 21] = [
            None, To, Plus, Minus, Mul, Div, Mod, Or, And, Xor, DimTo, Func, Equal, Big, Small,
            EBig, ESmall, ShiftL, ShiftR, ComboStr, NEqual,
        ];
        ALL.get(v as usize).copied()
    }

    /// Infix operator text for binary operators.
    pub fn symbol(self) -> Option<&'static str> {
        use OpeDataType::*;
        Some(match self {
            Plus => "+",
            Minus => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            Or => "|",
            And => "&",
            Xor => "^",
            Equal => "==",
            Big => ">",
            Small => "<",
            EBig => ">=",
            ESmall => "<=",
            ShiftL => "<<",
            ShiftR => ">>",
            ComboStr => "++",
            NEqual => "!=",
            None | To | DimTo | Func => return Option::None,
        })
    }
}

/// Built-in function called by a `Func` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OpeFunc(pub u8);

impl OpeFunc {
    pub const TRIM: OpeFunc = OpeFunc(0x11);
    pub const ARRAY_TO_STRING: OpeFunc = OpeFunc(0x1C);
    pub const ADD_ARRAY: OpeFunc = OpeFunc(0x42);
    pub const TRIM_ARRAY: OpeFunc = OpeFunc(0xA5);

    pub fn name(self) -> Option<&'static str> {
        FUNC_NAMES.get(self.0 as usize).copied()
    }
}

impl fmt::Display for OpeFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Func{:#04x}", self.0),
        }
    }
}

/// One fragment of an expression's readable form.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(String),
    Param(Param),
}

impl From<&str> for Token {
    fn from(s: &str) -> Token {
        Token::Text(s.to_string())
    }
}

impl From<Param> for Token {
    fn from(p: Param) -> Token {
        Token::Param(p)
    }
}

/// A single operator application bound to a result name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpeData {
    pub kind: OpeDataType,
    pub name: String,
    pub func: Option<OpeFunc>,
    pub operands: Vec<Param>,
}

enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(p: &Param) -> Option<Num> {
        match p {
            Param::Int(v) => Some(Num::Int(i64::from(*v))),
            Param::Flag(v) => Some(Num::Int(i64::from(*v))),
            Param::Float(e) => Some(Num::Float(e.to_f64())),
            Param::Var(_) | Param::Str(_) => None,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(v) => *v as f64,
            Num::Float(v) => *v,
        }
    }

    fn into_param(self) -> Param {
        match self {
            Num::Int(v) => match i32::try_from(v) {
                Ok(v) => Param::Int(v),
                Err(_) => Param::from(v as f64),
            },
            Num::Float(v) => Param::from(v),
        }
    }
}

fn floor_mod_i(a: i64, b: i64) -> i64 {
    ((a % b) + b) % b
}

fn floor_mod_f(a: f64, b: f64) -> f64 {
    ((a % b) + b) % b
}

impl OpeData {
    pub fn new(kind: OpeDataType, name: &str, operands: Vec<Param>) -> OpeData {
        OpeData {
            kind,
            name: name.to_string(),
            func: None,
            operands,
        }
    }

    pub fn call(func: OpeFunc, name: &str, operands: Vec<Param>) -> OpeData {
        OpeData {
            kind: OpeDataType::Func,
            name: name.to_string(),
            func: Some(func),
            operands,
        }
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<OpeData> {
        let offset = r.position();
        let tag = r.u8()?;
        let kind = OpeDataType::from_u8(tag).ok_or(LsbError::InvalidTag {
            what: "operator type",
            value: u32::from(tag),
            offset,
        })?;
        let name = r.string()?;
        let count = r.u32()? as usize;
        if count > r.remaining() {
            return Err(LsbError::Truncated {
                offset: r.position(),
                needed: count,
                remaining: r.remaining(),
            });
        }
        let func = r.read_if(kind == OpeDataType::Func, |r| r.u8().map(OpeFunc))?;
        let mut operands = Vec::with_capacity(count);
        for _ in 0..count {
            operands.push(Param::decode(r)?);
        }
        Ok(OpeData {
            kind,
            name,
            func,
            operands,
        })
    }

    pub(crate) fn encode(&self, w: &mut Writer) -> Result<()> {
        w.u8(self.kind as u8);
        w.string(&self.name)?;
        w.count(self.operands.len());
        if self.kind == OpeDataType::Func {
            w.u8(self.func.unwrap_or(OpeFunc(0)).0);
        }
        for p in &self.operands {
            p.encode(w)?;
        }
        Ok(())
    }

    fn pair(&self) -> Result<(&Param, &Param)> {
        match self.operands.as_slice() {
            [a, b] => Ok((a, b)),
            other => Err(LsbError::Unsupported(format!(
                "{:?} expects 2 operands, got {}",
                self.kind,
                other.len()
            ))),
        }
    }

    fn unsupported(&self, what: &str) -> LsbError {
        LsbError::Unsupported(format!("{:?}() {}", self.kind, what))
    }

    /// Readable form of this entry as text fragments and operands.
    ///
    /// Operators over literal operands are folded; any variable operand
    /// leaves the infix form unevaluated. String operands are never coerced
    /// to numbers.
    pub fn tokenize(&self) -> Result<Vec<Token>> {
        use OpeDataType::*;
        match self.kind {
            To => match self.operands.last() {
                Some(p) => Ok(vec![Token::Param(p.clone())]),
                Option::None => Err(self.unsupported("has no operand")),
            },
            DimTo => {
                let mut out = Vec::new();
                let mut ops = self.operands.iter();
                if let Some(first) = ops.next() {
                    out.push(Token::Param(first.clone()));
                }
                for p in ops {
                    out.push("[".into());
                    out.push(Token::Param(p.clone()));
                    out.push("]".into());
                }
                Ok(out)
            }
            Func => {
                let name = self.func.unwrap_or(OpeFunc(0)).to_string();
                let mut out = vec![Token::Text(format!("{}(", name))];
                for (i, p) in self.operands.iter().enumerate() {
                    if i > 0 {
                        out.push(", ".into());
                    }
                    out.push(Token::Param(p.clone()));
                }
                out.push(")".into());
                Ok(out)
            }
            None => Err(LsbError::Unsupported("cannot compute value for None operator".to_string())),
            kind => {
                let (a, b) = self.pair()?;
                let symbol = kind.symbol().unwrap_or("?");
                if a.is_var() || b.is_var() {
                    let infix = format!(" {} ", symbol);
                    if matches!(kind, Or | And) {
                        return Ok(vec![
                            "(".into(),
                            Token::Param(a.clone()),
                            Token::Text(infix),
                            Token::Param(b.clone()),
                            ")".into(),
                        ]);
                    }
                    return Ok(vec![Token::Param(a.clone()), Token::Text(infix), Token::Param(b.clone())]);
                }
                Ok(vec![Token::Param(self.fold(a, b)?)])
            }
        }
    }

    fn fold(&self, a: &Param, b: &Param) -> Result<Param> {
        use OpeDataType::*;
        match self.kind {
            Equal | NEqual => {
                let same = match (a, b) {
                    (Param::Str(x), Param::Str(y)) => x == y,
                    _ => match (Num::of(a), Num::of(b)) {
                        (Some(Num::Int(x)), Some(Num::Int(y))) => x == y,
                        (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
                        _ => false,
                    },
                };
                Ok(Param::from(if self.kind == Equal { same } else { !same }))
            }
            Big | Small | EBig | ESmall => {
                let ord = match (a, b) {
                    (Param::Str(x), Param::Str(y)) => x.partial_cmp(y),
                    _ => match (Num::of(a), Num::of(b)) {
                        (Some(Num::Int(x)), Some(Num::Int(y))) => x.partial_cmp(&y),
                        (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()),
                        _ => return Err(self.unsupported("cannot compare string and number")),
                    },
                };
                let ord = ord.ok_or_else(|| self.unsupported("unordered operands"))?;
                let res = match self.kind {
                    Big => ord.is_gt(),
                    Small => ord.is_lt(),
                    EBig => ord.is_ge(),
                    _ => ord.is_le(),
                };
                Ok(Param::from(res))
            }
            ComboStr => match (a, b) {
                (Param::Str(x), Param::Str(y)) => Ok(Param::Str(format!("{}{}", x, y))),
                _ => Err(self.unsupported("expected string type")),
            },
            _ => {
                let (x, y) = match (Num::of(a), Num::of(b)) {
                    (Some(x), Some(y)) => (x, y),
                    _ => return Err(self.unsupported("expected numeric type")),
                };
                self.fold_numeric(a, b, x, y)
            }
        }
    }

    fn fold_numeric(&self, a: &Param, b: &Param, x: Num, y: Num) -> Result<Param> {
        use OpeDataType::*;
        let ints = match (&x, &y) {
            (Num::Int(i), Num::Int(j)) => Some((*i, *j)),
            _ => Option::None,
        };
        let out = match self.kind {
            Plus => match ints {
                Some((i, j)) => Num::Int(i + j),
                Option::None => Num::Float(x.as_f64() + y.as_f64()),
            },
            Minus => match ints {
                Some((i, j)) => Num::Int(i - j),
                Option::None => Num::Float(x.as_f64() - y.as_f64()),
            },
            Mul => match ints {
                Some((i, j)) => Num::Int(i * j),
                Option::None => Num::Float(x.as_f64() * y.as_f64()),
            },
            Div => {
                if y.as_f64() == 0.0 {
                    return Err(self.unsupported("division by zero"));
                }
                Num::Float(x.as_f64() / y.as_f64())
            }
            Mod => match ints {
                Some((_, 0)) => return Err(self.unsupported("division by zero")),
                Some((i, j)) => Num::Int(floor_mod_i(i, j)),
                Option::None => {
                    if y.as_f64() == 0.0 {
                        return Err(self.unsupported("division by zero"));
                    }
                    Num::Float(floor_mod_f(x.as_f64(), y.as_f64()))
                }
            },
            Or | And if matches!((a, b), (Param::Flag(_), Param::Flag(_))) => {
                let (p, q) = (ints.map(|t| t.0 != 0), ints.map(|t| t.1 != 0));
                let res = match (p, q) {
                    (Some(p), Some(q)) if self.kind == Or => p || q,
                    (Some(p), Some(q)) => p && q,
                    _ => false,
                };
                return Ok(Param::from(res));
            }
            Or | And | Xor | ShiftL | ShiftR => {
                let (i, j) = ints.ok_or_else(|| self.unsupported("expected integer type"))?;
                match self.kind {
                    Or => Num::Int(i | j),
                    And => Num::Int(i & j),
                    Xor => Num::Int(i ^ j),
                    _ => {
                        let shift = u32::try_from(j)
                            .ok()
                            .filter(|s| *s < 32)
                            .ok_or_else(|| self.unsupported("shift out of range"))?;
                        if self.kind == ShiftL {
                            Num::Int(i64::from(i as i32).wrapping_shl(shift))
                        } else {
                            Num::Int(i >> shift)
                        }
                    }
                }
            }
            _ => return Err(self.unsupported("is not a numeric operator")),
        };
        Ok(out.into_param())
    }
}

impl fmt::Display for OpeData {
    /// Unresolved readable form; entries that cannot be folded render their
    /// operator name.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tokenize() {
            Ok(tokens) => {
                for t in tokens {
                    match t {
                        Token::Text(s) => f.write_str(&s)?,
                        Token::Param(p) => f.write_str(&p.to_lsc())?,
                    }
                }
                Ok(())
            }
            Err(_) => write!(f, "<{:?}>", self.kind),
        }
    }
}

/// Ordered chain of `OpeData` entries whose last entry is the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LiveParser {
    pub entries: Vec<OpeData>,
}

impl LiveParser {
    pub fn new(entries: Vec<OpeData>) -> LiveParser {
        LiveParser { entries }
    }

    /// Expression whose value is a single operand.
    pub fn from_value(value: Param) -> LiveParser {
        LiveParser::new(vec![OpeData::new(OpeDataType::To, ARG_NAME, vec![value])])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<LiveParser> {
        Ok(LiveParser {
            entries: r.array(OpeData::decode)?,
        })
    }

    pub(crate) fn encode(&self, w: &mut Writer) -> Result<()> {
        w.array(&self.entries, |w, e| e.encode(w))
    }

    pub(crate) fn decode_array(r: &mut Reader) -> Result<Vec<LiveParser>> {
        r.array(LiveParser::decode)
    }

    pub(crate) fn encode_array(w: &mut Writer, parsers: &[LiveParser]) -> Result<()> {
        w.array(parsers, |w, p| p.encode(w))
    }

    /// Fully substituted tokens for the final binding, with temporaries
    /// replaced by their own resolved tokens. Returns `None` when the chain
    /// does not end in an assignment.
    pub fn resolve(&self) -> Result<Option<Vec<Token>>> {
        let last = match self.entries.last() {
            Some(e) if e.kind == OpeDataType::To => e,
            Some(e) => {
                warn!("last entry in expression was not an assignment: {}", e);
                return Ok(None);
            }
            None => return Ok(None),
        };
        // later entries rebind a name; only entries the result uses are tokenized
        let bindings: HashMap<&str, &OpeData> = self.entries.iter().map(|e| (e.name.as_str(), e)).collect();
        let mut visiting = HashSet::new();
        substitute(&last.name, &bindings, &mut visiting).map(Some)
    }

    /// Source form of the expression: the bare value for argument
    /// expressions, `name = value` for assignments, empty for anything
    /// that does not end in an assignment.
    pub fn render(&self) -> Result<String> {
        let tokens = match self.resolve()? {
            Some(tokens) => tokens,
            None => return Ok(String::new()),
        };
        let value = render_tokens(&tokens);
        match self.entries.last() {
            Some(e) if e.name != ARG_NAME => Ok(format!("{} = {}", e.name, value)),
            _ => Ok(value),
        }
    }

    /// The constant operand this expression evaluates to, if it folds to one.
    pub fn literal(&self) -> Option<Param> {
        match self.resolve().ok()??.as_slice() {
            [Token::Param(p)] if !p.is_var() => Some(p.clone()),
            _ => None,
        }
    }
}

fn substitute(
    name: &str,
    bindings: &HashMap<&str, &OpeData>,
    visiting: &mut HashSet<String>,
) -> Result<Vec<Token>> {
    let entry = match bindings.get(name) {
        Some(entry) if !visiting.contains(name) => entry,
        _ => return Ok(vec![Token::Param(Param::Var(name.to_string()))]),
    };
    let tokens = entry.tokenize()?;
    visiting.insert(name.to_string());
    let mut out = Vec::with_capacity(tokens.len());
    for t in tokens {
        match t {
            Token::Param(Param::Var(v)) if v.starts_with(TEMP_PREFIX) => {
                out.extend(substitute(&v, bindings, visiting)?);
            }
            other => out.push(other),
        }
    }
    visiting.remove(name);
    Ok(out)
}

fn render_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for t in tokens {
        match t {
            Token::Text(s) => out.push_str(s),
            Token::Param(Param::Str(s)) => {
                out.push('"');
                out.push_str(&s.replace('\n', "\\n").replace('\r', "\\r"));
                out.push('"');
            }
            Token::Param(p) => out.push_str(&p.to_string()),
        }
    }
    out
}

const FUNC_NAMES: [&str; 171] = [
    "IntToStr", "IntToHex", "GetProp", "SetProp", "GetArraySize",
    "Length", "JLength", "Copy", "JCopy", "Delete",
    "JDelete", "Insert", "JInsert", "CompareStr", "CompareText",
    "Pos", "JPos", "Trim", "JTrim", "Exists",
    "Not", "SetArray", "FillMem", "CopyMem", "GetCheck",
    "SetCheck", "Random", "GetSaveCaption", "ArrayToString", "StringToArray",
    "IndexOfStr", "SortStr", "ListCompo", "ToClientX", "ToClientY",
    "ToScreenX", "ToScreenY", "Int", "Float", "Sin",
    "Cos", "Tan", "ArcSin", "ArcCos", "ArcTan",
    "ArcTan2", "Hypot", "IndexOfMenu", "Abs", "Fabs",
    "VarExists", "EncodeDate", "EncodeTime", "DecodeDate", "DecodeTime",
    "GetYear", "GetMonth", "GetDay", "GetHour", "GetMin",
    "GetSec", "GetWeek", "GetWeekStr", "GetWeekJStr", "FixStr",
    "GetDisplayMode", "AddArray", "InsertArray", "DeleteArray", "InPrimary",
    "CopyArray", "FileExists", "LoadTextFile", "LowerCase", "UpperCase",
    "ExtractFilePath", "ExtractFileName", "ExtractFileExt", "IsPathDelimiter", "AddBackSlash",
    "ChangeFileExt", "IsDelimiter", "StringOfChar", "StringReplace", "AssignTemp",
    "HanToZen", "ZenToHan", "DBCreateTable", "DBSetActive", "DBAddField",
    "DBSetRecNo", "DBInsert", "DBDelete", "DBGetInt", "DBSetInt",
    "DBGetFloat", "DBSetFloat", "DBGetBool", "DBSetBool", "DBGetStr",
    "DBSetStr", "DBRecordCount", "DBFindFirst", "DBFindLast", "DBFindNext",
    "DBFindPrior", "DBLocate", "DBLoadTsvFile", "DBDirectGetInt", "DBDirectSetInt",
    "DBDirectGetFloat", "DBDirectSetFloat", "DBDirectGetBool", "DBDirectSetBool", "DBDirectGetStr",
    "DBDirectSetStr", "DBCopyTable", "DBDeleteTable", "DBInsertTable", "DBCopy",
    "DBClearTable", "DBSort", "DBGetActive", "DBGetRecNo", "DBClearRecord",
    "SetWallPaper", "Min", "Max", "Fmin", "Fmax",
    "GetVarType", "GetEnabled", "SetEnabled", "AddDelimiter", "ListSaveCaption",
    "OpenUrl", "Calc", "SaveScreen", "StrToIntDef", "StrToFloatDef",
    "GetVisible", "SetVisible", "GetHistoryCount", "GetHistoryMaxCount", "SetHistoryMaxCount",
    "GetGroupIndex", "GetSelected", "SetSelected", "SelectOpenFile", "SelectSaveFile",
    "SelectDirectory", "ExtractFile", "Chr", "Ord", "InCabinet",
    "PushVar", "PopVar", "DeleteStack", "CopyFile", "DBGetTableCount",
    "DBGetTable", "CreateObject", "DeleteObject", "GetItem", "UniqueArray",
    "TrimArray", "GetImeOpened", "SetImeOpened", "Alert", "GetCinemaProp",
    "SetCinemaProp",
];

#[cfg(test)]
mod tests {
    use super::{Extended, LiveParser, OpeData, OpeDataType, OpeFunc, Param, ParamType, Token, ARG_NAME};
    use crate::codec::{Reader, Writer};
    use crate::LsbError;

    fn to(name: &str, p: Param) -> OpeData {
        OpeData::new(OpeDataType::To, name, vec![p])
    }

    fn var(name: &str) -> Param {
        Param::Var(name.to_string())
    }

    #[test]
    fn resolves_temporary_string_binding() {
        let lp = LiveParser::new(vec![to("____0", Param::from("x")), to(ARG_NAME, var("____0"))]);
        let tokens = lp.resolve().unwrap().unwrap();
        assert_eq!(tokens, vec![Token::Param(Param::from("x"))]);
        assert_eq!(lp.literal(), Some(Param::from("x")));
        assert_eq!(lp.render().unwrap(), "\"x\"");
    }

    #[test]
    fn renders_named_assignment_with_external_variable() {
        let lp = LiveParser::new(vec![
            OpeData::new(OpeDataType::Plus, "____0", vec![var("count"), Param::Int(1)]),
            to("count", var("____0")),
        ]);
        assert_eq!(lp.render().unwrap(), "count = count + 1");
        assert_eq!(lp.literal(), None);
    }

    #[test]
    fn renders_function_call_menu_choice() {
        let lp = LiveParser::new(vec![
            to("____0", Param::from("はい")),
            OpeData::call(OpeFunc::ADD_ARRAY, "____1", vec![var("_tmp"), var("____0")]),
            to(ARG_NAME, var("____1")),
        ]);
        assert_eq!(lp.render().unwrap(), "AddArray(_tmp, \"はい\")");
    }

    #[test]
    fn escapes_newlines_in_string_literals() {
        let lp = LiveParser::from_value(Param::from("a\r\nb"));
        assert_eq!(lp.render().unwrap(), "\"a\\r\\nb\"");
    }

    #[test]
    fn folds_literal_arithmetic_and_logic() {
        let plus = OpeData::new(OpeDataType::Plus, "____0", vec![Param::Int(2), Param::Int(3)]);
        assert_eq!(plus.tokenize().unwrap(), vec![Token::Param(Param::Int(5))]);

        let or = OpeData::new(OpeDataType::Or, "____0", vec![Param::Flag(0), Param::Flag(1)]);
        assert_eq!(or.tokenize().unwrap(), vec![Token::Param(Param::Flag(1))]);

        let bits = OpeData::new(OpeDataType::Or, "____0", vec![Param::Int(4), Param::Flag(1)]);
        assert_eq!(bits.tokenize().unwrap(), vec![Token::Param(Param::Int(5))]);

        let eq = OpeData::new(OpeDataType::Equal, "____0", vec![Param::from("a"), Param::from("a")]);
        assert_eq!(eq.tokenize().unwrap(), vec![Token::Param(Param::Flag(1))]);

        let modulo = OpeData::new(OpeDataType::Mod, "____0", vec![Param::Int(-7), Param::Int(3)]);
        assert_eq!(modulo.tokenize().unwrap(), vec![Token::Param(Param::Int(2))]);
    }

    #[test]
    fn variable_operands_stay_symbolic() {
        let and = OpeData::new(OpeDataType::And, "____0", vec![var("a"), Param::Flag(1)]);
        let lp = LiveParser::new(vec![and, to(ARG_NAME, var("____0"))]);
        assert_eq!(lp.render().unwrap(), "(a & 1)");
    }

    #[test]
    fn string_arithmetic_is_unsupported() {
        let plus = OpeData::new(OpeDataType::Plus, "____0", vec![Param::from("50"), Param::Int(100)]);
        assert!(matches!(plus.tokenize(), Err(LsbError::Unsupported(_))));
        let combo = OpeData::new(OpeDataType::ComboStr, "____0", vec![Param::Int(1), Param::from("a")]);
        assert!(matches!(combo.tokenize(), Err(LsbError::Unsupported(_))));
        let div = OpeData::new(OpeDataType::Div, "____0", vec![Param::Int(1), Param::Int(0)]);
        assert!(matches!(div.tokenize(), Err(LsbError::Unsupported(_))));
    }

    #[test]
    fn non_assignment_tail_renders_empty() {
        let lp = LiveParser::new(vec![OpeData::new(OpeDataType::Plus, "____0", vec![var("a"), var("b")])]);
        assert_eq!(lp.render().unwrap(), "");
        assert_eq!(LiveParser::default().render().unwrap(), "");
    }

    #[test]
    fn unused_entries_are_not_folded() {
        let unused = OpeData::new(OpeDataType::Plus, "____1", vec![Param::from("a"), Param::from("b")]);
        let lp = LiveParser::new(vec![unused.clone(), to("x", Param::Int(1))]);
        assert_eq!(lp.render().unwrap(), "x = 1");

        let lp = LiveParser::new(vec![unused, to("x", var("____1"))]);
        assert!(matches!(lp.render(), Err(LsbError::Unsupported(_))));
    }

    #[test]
    fn self_reference_does_not_recurse_forever() {
        let lp = LiveParser::new(vec![to(ARG_NAME, var("____0")), to("____0", var("____0"))]);
        assert_eq!(lp.resolve().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn array_access_renders_subscripts() {
        let dim = OpeData::new(OpeDataType::DimTo, "____0", vec![var("arr"), Param::Int(1), var("i")]);
        let lp = LiveParser::new(vec![dim, to(ARG_NAME, var("____0"))]);
        assert_eq!(lp.render().unwrap(), "arr[1][i]");
    }

    #[test]
    fn infer_respects_hints() {
        assert_eq!(Param::infer("12", None).unwrap(), Param::Int(12));
        assert_eq!(Param::infer("abc", None).unwrap(), Param::from("abc"));
        assert_eq!(Param::infer("abc", Some(ParamType::Var)).unwrap(), var("abc"));
        assert_eq!(Param::infer("1", Some(ParamType::Flag)).unwrap(), Param::Flag(1));
        assert_eq!(Param::infer("12", Some(ParamType::Str)).unwrap(), Param::from("12"));
        assert!(Param::infer("x", Some(ParamType::Int)).is_err());
    }

    #[test]
    fn extended_float_conversions() {
        for v in [0.0, 1.0, -2.5, 1e-300, 123456.789, f64::MIN_POSITIVE / 4.0] {
            assert_eq!(Extended::from_f64(v).to_f64(), v);
        }
        // 1.0: explicit integer bit, biased exponent 0x3FFF
        assert_eq!(
            Extended::from_f64(1.0).0,
            [0, 0, 0, 0, 0, 0, 0, 0x80, 0xFF, 0x3F]
        );
        assert_eq!(Param::from(2.0).to_string(), "2.0");
    }

    #[test]
    fn live_parser_wire_format() {
        let lp = LiveParser::new(vec![
            OpeData::call(OpeFunc::TRIM, "____0", vec![var("s")]),
            to(ARG_NAME, var("____0")),
        ]);
        let mut w = Writer::new();
        lp.encode(&mut w).unwrap();
        let bytes = w.into_inner();
        assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
        // type, name "____0", count, func id
        assert_eq!(bytes[4], OpeDataType::Func as u8);
        assert_eq!(&bytes[5..9], &[5, 0, 0, 0]);
        assert_eq!(&bytes[14..18], &[1, 0, 0, 0]);
        assert_eq!(bytes[18], 0x11);
        let mut r = Reader::new(&bytes);
        assert_eq!(LiveParser::decode(&mut r).unwrap(), lp);
        assert!(r.is_empty());
    }

    #[test]
    fn float_operand_bytes_are_preserved() {
        let raw = Extended([1, 2, 3, 4, 5, 6, 7, 0x88, 0x01, 0x40]);
        let mut w = Writer::new();
        Param::Float(raw).encode(&mut w).unwrap();
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 11);
        let mut r = Reader::new(&bytes);
        assert_eq!(Param::decode(&mut r).unwrap(), Param::Float(raw));
    }

    #[test]
    fn rejects_unknown_param_tag() {
        let bytes = [9u8, 0, 0, 0, 0];
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            Param::decode(&mut r),
            Err(LsbError::InvalidTag { what: "param type", value: 9, offset: 0 })
        ));
    }
}
