//! The closed value type set, schemas, tuples, and their binary codec.
//!
//! One value-codec serves two callers: heap records (§4.2) and WAL value
//! payloads (§4.5) share this exact wire shape, so there is a single place
//! that knows how a `Value` looks on disk.

use crate::error::{CoreError, Result};
use std::cmp::Ordering;

/// The closed set of value types a column may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Char,
    Varchar,
    Text,
    Date,
    Time,
    Timestamp,
    Json,
    Blob,
}

/// A tagged scalar over the closed type set.
///
/// `Decimal` is string-backed (exact, arbitrary precision) since the set has
/// no native fixed-point primitive. `Date`/`Time`/`Timestamp` are signed
/// 64-bit counts (days / milliseconds / milliseconds-since-epoch) so every
/// numeric-ish variant stays fixed-width on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal(String),
    Char(String),
    Varchar(String),
    Text(String),
    Date(i64),
    Time(i64),
    Timestamp(i64),
    Json(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int8(_) => ValueType::Int8,
            Value::Int16(_) => ValueType::Int16,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Float32(_) => ValueType::Float32,
            Value::Float64(_) => ValueType::Float64,
            Value::Decimal(_) => ValueType::Decimal,
            Value::Char(_) => ValueType::Char,
            Value::Varchar(_) => ValueType::Varchar,
            Value::Text(_) => ValueType::Text,
            Value::Date(_) => ValueType::Date,
            Value::Time(_) => ValueType::Time,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Json(_) => ValueType::Json,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Total order over values per the glossary's comparison rule: numerics
/// compare numerically, text compares lexicographically on bytes, and NULL
/// never compares equal/less/greater to anything, including another NULL
/// (`x == NULL` is NULL, not true) — so this returns `None` whenever either
/// side is `Value::Null`.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        (Null, _) | (_, Null) => None,
        (Bool(x), Bool(y)) => x.partial_cmp(y),
        (Int8(x), Int8(y)) => x.partial_cmp(y),
        (Int16(x), Int16(y)) => x.partial_cmp(y),
        (Int32(x), Int32(y)) => x.partial_cmp(y),
        (Int64(x), Int64(y)) => x.partial_cmp(y),
        (Float32(x), Float32(y)) => x.partial_cmp(y),
        (Float64(x), Float64(y)) => x.partial_cmp(y),
        (Decimal(x), Decimal(y)) => x.partial_cmp(y),
        (Char(x), Char(y)) => x.as_bytes().partial_cmp(y.as_bytes()),
        (Varchar(x), Varchar(y)) => x.as_bytes().partial_cmp(y.as_bytes()),
        (Text(x), Text(y)) => x.as_bytes().partial_cmp(y.as_bytes()),
        (Date(x), Date(y)) => x.partial_cmp(y),
        (Time(x), Time(y)) => x.partial_cmp(y),
        (Timestamp(x), Timestamp(y)) => x.partial_cmp(y),
        (Json(x), Json(y)) => x.as_bytes().partial_cmp(y.as_bytes()),
        (Blob(x), Blob(y)) => x.partial_cmp(y),
        // Numeric cross-width comparisons normalize through i64/f64.
        _ => numeric_as_f64(a).zip(numeric_as_f64(b)).and_then(|(x, y)| x.partial_cmp(&y)),
    }
}

fn numeric_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int8(n) => Some(*n as f64),
        Value::Int16(n) => Some(*n as f64),
        Value::Int32(n) => Some(*n as f64),
        Value::Int64(n) => Some(*n as f64),
        Value::Float32(n) => Some(*n as f64),
        Value::Float64(n) => Some(*n),
        Value::Date(n) | Value::Time(n) | Value::Timestamp(n) => Some(*n as f64),
        _ => None,
    }
}

/// One column in a schema: name, declared type, and whether `NULL` is a
/// legal value for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ValueType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ValueType, nullable: bool) -> Self {
        Self { name: name.into(), ty, nullable }
    }
}

/// An ordered sequence of columns. A tuple is a `Vec<Value>` aligned with a
/// schema's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }
}

pub type Tuple = Vec<Value>;

// --- Binary codec -----------------------------------------------------
//
// Tag byte followed by a fixed-width or length-prefixed (u32 LE) payload.
// `Null` is the tag alone. This is the one wire shape shared by heap
// records and WAL value payloads.

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I8: u8 = 2;
const TAG_I16: u8 = 3;
const TAG_I32: u8 = 4;
const TAG_I64: u8 = 5;
const TAG_F32: u8 = 6;
const TAG_F64: u8 = 7;
const TAG_DECIMAL: u8 = 8;
const TAG_CHAR: u8 = 9;
const TAG_VARCHAR: u8 = 10;
const TAG_TEXT: u8 = 11;
const TAG_DATE: u8 = 12;
const TAG_TIME: u8 = 13;
const TAG_TIMESTAMP: u8 = 14;
const TAG_JSON: u8 = 15;
const TAG_BLOB: u8 = 16;

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn take_bytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    if *pos + 4 > buf.len() {
        return Err(CoreError::Corrupt("truncated length prefix".to_string()));
    }
    let len = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if *pos + len > buf.len() {
        return Err(CoreError::Corrupt("truncated value payload".to_string()));
    }
    let out = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}

fn take_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let bytes = take_bytes(buf, pos)?;
    String::from_utf8(bytes).map_err(|e| CoreError::Corrupt(e.to_string()))
}

/// Append `value`'s binary encoding to `buf`.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(*b as u8);
        }
        Value::Int8(n) => {
            buf.push(TAG_I8);
            buf.push(*n as u8);
        }
        Value::Int16(n) => {
            buf.push(TAG_I16);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Int32(n) => {
            buf.push(TAG_I32);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Int64(n) => {
            buf.push(TAG_I64);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float32(n) => {
            buf.push(TAG_F32);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float64(n) => {
            buf.push(TAG_F64);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Decimal(s) => {
            buf.push(TAG_DECIMAL);
            push_bytes(buf, s.as_bytes());
        }
        Value::Char(s) => {
            buf.push(TAG_CHAR);
            push_bytes(buf, s.as_bytes());
        }
        Value::Varchar(s) => {
            buf.push(TAG_VARCHAR);
            push_bytes(buf, s.as_bytes());
        }
        Value::Text(s) => {
            buf.push(TAG_TEXT);
            push_bytes(buf, s.as_bytes());
        }
        Value::Date(n) => {
            buf.push(TAG_DATE);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Time(n) => {
            buf.push(TAG_TIME);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Timestamp(n) => {
            buf.push(TAG_TIMESTAMP);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Json(s) => {
            buf.push(TAG_JSON);
            push_bytes(buf, s.as_bytes());
        }
        Value::Blob(b) => {
            buf.push(TAG_BLOB);
            push_bytes(buf, b);
        }
    }
}

/// Decode one value starting at `*pos`, advancing it past the value.
pub fn decode_value(buf: &[u8], pos: &mut usize) -> Result<Value> {
    if *pos >= buf.len() {
        return Err(CoreError::Corrupt("truncated value tag".to_string()));
    }
    let tag = buf[*pos];
    *pos += 1;
    macro_rules! fixed {
        ($ty:ty, $n:expr) => {{
            if *pos + $n > buf.len() {
                return Err(CoreError::Corrupt("truncated fixed-width value".to_string()));
            }
            let arr: [u8; $n] = buf[*pos..*pos + $n].try_into().unwrap();
            *pos += $n;
            <$ty>::from_le_bytes(arr)
        }};
    }
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => {
            if *pos >= buf.len() {
                return Err(CoreError::Corrupt("truncated bool".to_string()));
            }
            let b = buf[*pos] != 0;
            *pos += 1;
            Value::Bool(b)
        }
        TAG_I8 => {
            if *pos >= buf.len() {
                return Err(CoreError::Corrupt("truncated i8".to_string()));
            }
            let n = buf[*pos] as i8;
            *pos += 1;
            Value::Int8(n)
        }
        TAG_I16 => Value::Int16(fixed!(i16, 2)),
        TAG_I32 => Value::Int32(fixed!(i32, 4)),
        TAG_I64 => Value::Int64(fixed!(i64, 8)),
        TAG_F32 => Value::Float32(fixed!(f32, 4)),
        TAG_F64 => Value::Float64(fixed!(f64, 8)),
        TAG_DECIMAL => Value::Decimal(take_string(buf, pos)?),
        TAG_CHAR => Value::Char(take_string(buf, pos)?),
        TAG_VARCHAR => Value::Varchar(take_string(buf, pos)?),
        TAG_TEXT => Value::Text(take_string(buf, pos)?),
        TAG_DATE => Value::Date(fixed!(i64, 8)),
        TAG_TIME => Value::Time(fixed!(i64, 8)),
        TAG_TIMESTAMP => Value::Timestamp(fixed!(i64, 8)),
        TAG_JSON => Value::Json(take_string(buf, pos)?),
        TAG_BLOB => Value::Blob(take_bytes(buf, pos)?),
        other => return Err(CoreError::Corrupt(format!("unknown value tag {}", other))),
    })
}

/// Encode a whole tuple as a `u32` count followed by each value in order.
pub fn encode_values(buf: &mut Vec<u8>, values: &[Value]) {
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        encode_value(buf, v);
    }
}

/// Decode a tuple previously written by [`encode_values`].
pub fn decode_values(buf: &[u8], pos: &mut usize) -> Result<Vec<Value>> {
    if *pos + 4 > buf.len() {
        return Err(CoreError::Corrupt("truncated value count".to_string()));
    }
    let count = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(decode_value(buf, pos)?);
    }
    Ok(out)
}
