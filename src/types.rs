use std::cmp::Ordering;
use std::fmt;

use crate::error::{GraphError, Result};

/// Vertex identifiers are 26-bit; the graph holds at most 2^26 vertices.
pub const VID_BITS: u32 = 26;
/// An edge id packs both endpoints: `(out_vid << 26) | in_vid`.
pub const EID_BITS: u32 = VID_BITS * 2;
/// Property key bits within a pid (`64 - EID_BITS`).
pub const PID_BITS: u32 = 64 - EID_BITS;

pub const VID_MASK: u64 = (1 << VID_BITS) - 1;
pub const PKEY_MASK: u64 = (1 << PID_BITS) - 1;

pub type LabelId = u16;

/// Pseudo property key addressing the element label in `has`/projection
/// parameters.
pub const LABEL_PKEY: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Vid(pub u32);

impl Vid {
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Worker that owns this vertex.
    #[inline]
    pub fn owner(self, workers: usize) -> usize {
        self.0 as usize % workers
    }
}

impl fmt::Display for Vid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eid {
    pub out_v: Vid,
    pub in_v: Vid,
}

impl Eid {
    pub fn new(out_v: Vid, in_v: Vid) -> Self {
        Eid { out_v, in_v }
    }

    #[inline]
    pub fn value(self) -> u64 {
        ((self.out_v.0 as u64) << VID_BITS) | self.in_v.0 as u64
    }

    #[inline]
    pub fn from_value(v: u64) -> Self {
        Eid {
            out_v: Vid(((v >> VID_BITS) & VID_MASK) as u32),
            in_v: Vid((v & VID_MASK) as u32),
        }
    }

    /// An edge item lives on the worker owning its out-vertex.
    #[inline]
    pub fn owner(self, workers: usize) -> usize {
        self.out_v.owner(workers)
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.out_v, self.in_v)
    }
}

/// Vertex property id: `(vid << 12) | pkey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vpid(pub u64);

impl Vpid {
    pub fn new(vid: Vid, pkey: LabelId) -> Self {
        Vpid(((vid.0 as u64) << PID_BITS) | pkey as u64)
    }

    #[inline]
    pub fn vid(self) -> Vid {
        Vid((self.0 >> PID_BITS) as u32)
    }

    #[inline]
    pub fn pkey(self) -> LabelId {
        (self.0 & PKEY_MASK) as LabelId
    }
}

/// Edge property id: `(eid << 12) | pkey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epid(pub u64);

impl Epid {
    pub fn new(eid: Eid, pkey: LabelId) -> Self {
        Epid((eid.value() << PID_BITS) | pkey as u64)
    }

    #[inline]
    pub fn eid(self) -> Eid {
        Eid::from_value(self.0 >> PID_BITS)
    }

    #[inline]
    pub fn pkey(self) -> LabelId {
        (self.0 & PKEY_MASK) as LabelId
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Vertex,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
    Both,
}

/// Wire type tags: 1=int, 2=double, 3=char, 4=string, 5=list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    Int = 1,
    Double = 2,
    Char = 3,
    Str = 4,
    List = 5,
}

impl ValueTag {
    pub fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => ValueTag::Int,
            2 => ValueTag::Double,
            3 => ValueTag::Char,
            4 => ValueTag::Str,
            5 => ValueTag::List,
            other => {
                return Err(GraphError::Corruption(format!(
                    "unknown value tag {other}"
                )))
            }
        })
    }
}

/// A typed payload value. On the wire this is `{ type: u8, content: bytes }`;
/// the `List` composite carries spliced multi-result placeholders the same
/// way scalar values do.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Double(f64),
    Char(char),
    Str(String),
    List(Vec<Value>),
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Int(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Char(a), Char(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            // cross-type order by tag, stable but arbitrary
            (a, b) => a.tag_rank().cmp(&b.tag_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Value::Int(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Char(v) => v.hash(state),
            Value::Str(v) => v.hash(state),
            Value::List(v) => v.hash(state),
        }
    }
}

impl Value {
    fn tag_rank(&self) -> u8 {
        match self {
            Value::Int(_) => 1,
            Value::Double(_) => 2,
            Value::Char(_) => 3,
            Value::Str(_) => 4,
            Value::List(_) => 5,
        }
    }

    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Int(_) => ValueTag::Int,
            Value::Double(_) => ValueTag::Double,
            Value::Char(_) => ValueTag::Char,
            Value::Str(_) => ValueTag::Str,
            Value::List(_) => ValueTag::List,
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Double(v) => Ok(*v as i64),
            Value::Str(s) => s
                .parse()
                .map_err(|_| GraphError::InvalidArgument(format!("not an int: {s}"))),
            other => Err(GraphError::InvalidArgument(format!(
                "not an int: {other}"
            ))),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        Ok(self.as_int()? as u64)
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            Value::Int(v) => Ok(*v as f64),
            Value::Double(v) => Ok(*v),
            Value::Str(s) => s
                .parse()
                .map_err(|_| GraphError::InvalidArgument(format!("not a double: {s}"))),
            other => Err(GraphError::InvalidArgument(format!(
                "not a double: {other}"
            ))),
        }
    }

    pub fn as_list(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    /// Parses a query literal: quoted strings, single-quoted chars, ints,
    /// doubles. Mirrors the surface-syntax type inference of the planner.
    pub fn from_literal(text: &str) -> Result<Value> {
        let t = text.trim();
        if t.is_empty() {
            return Err(GraphError::Parse("empty literal".into()));
        }
        if (t.starts_with('"') && t.ends_with('"') && t.len() >= 2)
            || (t.starts_with('\'') && t.ends_with('\'') && t.len() >= 2)
        {
            let inner = &t[1..t.len() - 1];
            let mut chars = inner.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if t.starts_with('\'') {
                    return Ok(Value::Char(c));
                }
            }
            return Ok(Value::Str(inner.to_string()));
        }
        if let Ok(v) = t.parse::<i64>() {
            return Ok(Value::Int(v));
        }
        if let Ok(v) = t.parse::<f64>() {
            return Ok(Value::Double(v));
        }
        Ok(Value::Str(t.to_string()))
    }

    /// Encodes to the wire form `{ type, content }`.
    pub fn encode(&self) -> (u8, Vec<u8>) {
        match self {
            Value::Int(v) => (ValueTag::Int as u8, v.to_le_bytes().to_vec()),
            Value::Double(v) => (ValueTag::Double as u8, v.to_le_bytes().to_vec()),
            Value::Char(v) => {
                let mut buf = [0u8; 4];
                let s = v.encode_utf8(&mut buf);
                (ValueTag::Char as u8, s.as_bytes().to_vec())
            }
            Value::Str(v) => (ValueTag::Str as u8, v.as_bytes().to_vec()),
            Value::List(items) => {
                let mut out = Vec::new();
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    let (tag, content) = item.encode();
                    out.push(tag);
                    out.extend_from_slice(&(content.len() as u32).to_le_bytes());
                    out.extend_from_slice(&content);
                }
                (ValueTag::List as u8, out)
            }
        }
    }

    pub fn decode(tag: u8, content: &[u8]) -> Result<Value> {
        let corrupt = || GraphError::Corruption("truncated value payload".into());
        Ok(match ValueTag::from_u8(tag)? {
            ValueTag::Int => {
                let bytes: [u8; 8] = content.try_into().map_err(|_| corrupt())?;
                Value::Int(i64::from_le_bytes(bytes))
            }
            ValueTag::Double => {
                let bytes: [u8; 8] = content.try_into().map_err(|_| corrupt())?;
                Value::Double(f64::from_le_bytes(bytes))
            }
            ValueTag::Char => {
                let s = std::str::from_utf8(content).map_err(|_| corrupt())?;
                Value::Char(s.chars().next().ok_or_else(corrupt)?)
            }
            ValueTag::Str => {
                Value::Str(String::from_utf8(content.to_vec()).map_err(|_| corrupt())?)
            }
            ValueTag::List => {
                if content.len() < 4 {
                    return Err(corrupt());
                }
                let count = u32::from_le_bytes(content[0..4].try_into().unwrap()) as usize;
                let mut items = Vec::with_capacity(count);
                let mut off = 4;
                for _ in 0..count {
                    if off + 5 > content.len() {
                        return Err(corrupt());
                    }
                    let item_tag = content[off];
                    let len = u32::from_le_bytes(
                        content[off + 1..off + 5].try_into().unwrap(),
                    ) as usize;
                    off += 5;
                    if off + len > content.len() {
                        return Err(corrupt());
                    }
                    items.push(Value::decode(item_tag, &content[off..off + len])?);
                    off += len;
                }
                Value::List(items)
            }
        })
    }

    /// Approximate in-flight size, used by the message builder to split
    /// oversized payloads.
    pub fn mem_size(&self) -> usize {
        match self {
            Value::Int(_) | Value::Double(_) => 9,
            Value::Char(_) => 5,
            Value::Str(s) => 1 + s.len(),
            Value::List(items) => 5 + items.iter().map(Value::mem_size).sum::<usize>(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Char(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eid_round_trip() {
        let eid = Eid::new(Vid(12), Vid(34));
        assert_eq!(Eid::from_value(eid.value()), eid);
        assert_eq!(eid.value(), (12u64 << VID_BITS) | 34);
    }

    #[test]
    fn pid_packing() {
        let vpid = Vpid::new(Vid(6), 3);
        assert_eq!(vpid.vid(), Vid(6));
        assert_eq!(vpid.pkey(), 3);

        let epid = Epid::new(Eid::new(Vid(1), Vid(2)), 7);
        assert_eq!(epid.eid(), Eid::new(Vid(1), Vid(2)));
        assert_eq!(epid.pkey(), 7);
    }

    #[test]
    fn value_wire_round_trip() {
        let values = vec![
            Value::Int(-42),
            Value::Double(2.5),
            Value::Char('x'),
            Value::Str("marko".into()),
            Value::List(vec![Value::Int(1), Value::Str("a".into())]),
        ];
        for v in values {
            let (tag, content) = v.encode();
            assert_eq!(Value::decode(tag, &content).unwrap(), v);
        }
    }

    #[test]
    fn literal_inference() {
        assert_eq!(Value::from_literal("42").unwrap(), Value::Int(42));
        assert_eq!(Value::from_literal("4.5").unwrap(), Value::Double(4.5));
        assert_eq!(
            Value::from_literal("\"name\"").unwrap(),
            Value::Str("name".into())
        );
        assert_eq!(Value::from_literal("'c'").unwrap(), Value::Char('c'));
    }
}
