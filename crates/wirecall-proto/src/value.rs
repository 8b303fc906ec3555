//! Type-tagged value codec.
//!
//! Every argument and return value crossing the wire is a [`Value`]. The
//! encoding is self-describing: a 3-byte big-endian tag followed by a
//! kind-specific body. Composite kinds (list, tuple) nest recursively; maps
//! are carried as JSON text so string-keyed dictionaries have one stable
//! textual form.
//!
//! Floats travel as ASCII hexadecimal float literals
//! (`-0x1.4000000000000p+1` style), which round-trips the full IEEE-754 bit
//! pattern without depending on decimal formatting behavior.
//!
//! # Invariants
//!
//! - `unpack_values(pack_values(vs)) == vs` for every supported value,
//!   including the list/tuple distinction.
//! - Map bodies contain only JSON-representable kinds; `Bytes` and `Tuple`
//!   inside a map are rejected at encode time.

use std::collections::BTreeMap;

use bytes::BufMut;

use crate::{
    INT_LEN, TAG_LEN,
    errors::{ProtocolError, Result},
    stream::ByteStream,
};

/// Tag for a signed 32-bit integer.
const TAG_INT: u32 = 0x001;
/// Tag for an IEEE-754 double carried as hexadecimal text.
const TAG_FLOAT: u32 = 0x002;
/// Tag for a UTF-8 string.
const TAG_STR: u32 = 0x003;
/// Tag for an ordered list.
const TAG_LIST: u32 = 0x004;
/// Tag for a string-keyed map (JSON body).
const TAG_MAP: u32 = 0x005;
/// Tag for a tuple (same framing as list, distinct identity).
const TAG_TUPLE: u32 = 0x006;
/// Tag for a raw byte string.
const TAG_BYTES: u32 = 0x007;
/// Tag for a boolean.
const TAG_BOOL: u32 = 0x008;
/// Tag for null.
const TAG_NULL: u32 = 0x009;

/// A single wire value.
///
/// Tuples and lists share their framing but carry different tags; decoders
/// must preserve the distinction because handler signatures rely on it
/// (positional arguments are a tuple, never a list).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Signed 32-bit integer.
    Int(i32),
    /// IEEE-754 double-precision float.
    Float(f64),
    /// UTF-8 text.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Boolean.
    Bool(bool),
    /// Null / absent.
    Null,
    /// Ordered list of values.
    List(Vec<Value>),
    /// Tuple of values (distinct from a list on the wire).
    Tuple(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Human-readable kind name for diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Bool(_) => "bool",
            Self::Null => "null",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Map(_) => "map",
        }
    }

    /// The integer payload, if this value is an `Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The string payload, if this value is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    /// The map payload, if this value is a `Map`.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Encode a sequence of values into one byte string.
///
/// # Errors
///
/// - `ProtocolError::UnsupportedType` for map values that JSON cannot carry
///   (`Bytes`, `Tuple`) or non-finite floats inside a map.
/// - `ProtocolError::MapBody` if JSON serialization fails.
pub fn pack_values(values: &[Value]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for value in values {
        pack_one(value, &mut out)?;
    }
    Ok(out)
}

fn pack_one(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Int(v) => {
            out.put_uint(u64::from(TAG_INT), TAG_LEN);
            out.put_i32(*v);
        },
        Value::Float(v) => {
            out.put_uint(u64::from(TAG_FLOAT), TAG_LEN);
            let text = float_to_hex(*v);
            out.put_u32(text.len() as u32);
            out.put_slice(text.as_bytes());
        },
        Value::Str(v) => {
            out.put_uint(u64::from(TAG_STR), TAG_LEN);
            out.put_u32(v.len() as u32);
            out.put_slice(v.as_bytes());
        },
        Value::Bytes(v) => {
            out.put_uint(u64::from(TAG_BYTES), TAG_LEN);
            out.put_u32(v.len() as u32);
            out.put_slice(v);
        },
        Value::Bool(v) => {
            out.put_uint(u64::from(TAG_BOOL), TAG_LEN);
            out.put_u8(u8::from(*v));
        },
        Value::Null => {
            out.put_uint(u64::from(TAG_NULL), TAG_LEN);
        },
        Value::List(items) => {
            out.put_uint(u64::from(TAG_LIST), TAG_LEN);
            let inner = pack_values(items)?;
            out.put_u32(inner.len() as u32);
            out.put_slice(&inner);
        },
        Value::Tuple(items) => {
            out.put_uint(u64::from(TAG_TUPLE), TAG_LEN);
            let inner = pack_values(items)?;
            out.put_u32(inner.len() as u32);
            out.put_slice(&inner);
        },
        Value::Map(map) => {
            out.put_uint(u64::from(TAG_MAP), TAG_LEN);
            let json = map_to_json(map)?;
            let text = serde_json::to_string(&json)
                .map_err(|e| ProtocolError::MapBody(e.to_string()))?;
            out.put_u32(text.len() as u32);
            out.put_slice(text.as_bytes());
        },
    }
    Ok(())
}

/// Decode a byte string produced by [`pack_values`].
///
/// # Errors
///
/// - `ProtocolError::Truncated` if a body is shorter than its tag promises.
/// - `ProtocolError::UnknownTag` for tags outside the tag set.
/// - `ProtocolError::Utf8` / `ProtocolError::FloatSyntax` /
///   `ProtocolError::MapBody` for malformed bodies.
pub fn unpack_values(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut stream = ByteStream::from_bytes(bytes);
    let mut values = Vec::new();
    while !stream.is_exhausted() {
        values.push(unpack_one(&mut stream)?);
    }
    Ok(values)
}

fn unpack_one(stream: &mut ByteStream) -> Result<Value> {
    let tag = stream.next_uint(TAG_LEN)? as u32;
    match tag {
        TAG_INT => Ok(Value::Int(stream.next_int()?)),
        TAG_FLOAT => {
            let len = stream.next_uint(INT_LEN)? as usize;
            let text = utf8(stream.next_bytes(len)?)?;
            Ok(Value::Float(float_from_hex(&text)?))
        },
        TAG_STR => {
            let len = stream.next_uint(INT_LEN)? as usize;
            Ok(Value::Str(utf8(stream.next_bytes(len)?)?))
        },
        TAG_BYTES => {
            let len = stream.next_uint(INT_LEN)? as usize;
            Ok(Value::Bytes(stream.next_bytes(len)?.to_vec()))
        },
        TAG_BOOL => {
            let byte = stream.next_bytes(1)?[0];
            Ok(Value::Bool(byte == 1))
        },
        TAG_NULL => Ok(Value::Null),
        TAG_LIST => {
            let len = stream.next_uint(INT_LEN)? as usize;
            let inner = stream.next_bytes(len)?.to_vec();
            Ok(Value::List(unpack_values(&inner)?))
        },
        TAG_TUPLE => {
            let len = stream.next_uint(INT_LEN)? as usize;
            let inner = stream.next_bytes(len)?.to_vec();
            Ok(Value::Tuple(unpack_values(&inner)?))
        },
        TAG_MAP => {
            let len = stream.next_uint(INT_LEN)? as usize;
            let text = utf8(stream.next_bytes(len)?)?;
            let json: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| ProtocolError::MapBody(e.to_string()))?;
            match json {
                serde_json::Value::Object(obj) => {
                    let mut map = BTreeMap::new();
                    for (key, val) in obj {
                        map.insert(key, json_to_value(&val)?);
                    }
                    Ok(Value::Map(map))
                },
                other => Err(ProtocolError::MapBody(format!(
                    "expected JSON object, found {other}"
                ))),
            }
        },
        other => Err(ProtocolError::UnknownTag(other)),
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::Utf8(e.to_string()))
}

/// Convert a map into its JSON body.
fn map_to_json(map: &BTreeMap<String, Value>) -> Result<serde_json::Value> {
    let mut obj = serde_json::Map::new();
    for (key, value) in map {
        obj.insert(key.clone(), value_to_json(value)?);
    }
    Ok(serde_json::Value::Object(obj))
}

fn value_to_json(value: &Value) -> Result<serde_json::Value> {
    match value {
        Value::Int(v) => Ok(serde_json::Value::from(*v)),
        Value::Float(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .ok_or(ProtocolError::UnsupportedType("non-finite float in map")),
        Value::Str(v) => Ok(serde_json::Value::from(v.as_str())),
        Value::Bool(v) => Ok(serde_json::Value::from(*v)),
        Value::Null => Ok(serde_json::Value::Null),
        Value::List(items) => {
            let converted: Result<Vec<_>> = items.iter().map(value_to_json).collect();
            Ok(serde_json::Value::Array(converted?))
        },
        Value::Map(map) => map_to_json(map),
        Value::Bytes(_) => Err(ProtocolError::UnsupportedType("bytes in map")),
        Value::Tuple(_) => Err(ProtocolError::UnsupportedType("tuple in map")),
    }
}

fn json_to_value(json: &serde_json::Value) -> Result<Value> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(v) => Ok(Value::Bool(*v)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    return Ok(Value::Int(small));
                }
            }
            n.as_f64()
                .map(Value::Float)
                .ok_or_else(|| ProtocolError::MapBody(format!("unrepresentable number {n}")))
        },
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_json::Value::Array(items) => {
            let converted: Result<Vec<_>> = items.iter().map(json_to_value).collect();
            Ok(Value::List(converted?))
        },
        serde_json::Value::Object(obj) => {
            let mut map = BTreeMap::new();
            for (key, val) in obj {
                map.insert(key.clone(), json_to_value(val)?);
            }
            Ok(Value::Map(map))
        },
    }
}

/// Number of hex digits carried for the 52-bit fraction.
const FRAC_DIGITS: usize = 13;
/// Exponent of all subnormal doubles.
const SUBNORMAL_EXP: i32 = -1022;

/// Format a double as a hexadecimal float literal.
///
/// Canonical forms: `[-]0x1.<13 hex digits>p<±exp>` for normals,
/// `[-]0x0.<13 hex digits>p-1022` for subnormals, `[-]0x0.0p+0` for zero,
/// and the literals `inf` / `-inf` / `nan` for specials. The fixed 13-digit
/// fraction carries the full 52-bit significand, so every bit pattern has
/// exactly one textual form.
#[must_use]
pub fn float_to_hex(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }

    let bits = value.to_bits();
    let sign = if bits >> 63 == 1 { "-" } else { "" };
    let exp_bits = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & 0x000f_ffff_ffff_ffff;

    if exp_bits == 0 {
        if frac == 0 {
            return format!("{sign}0x0.0p+0");
        }
        return format!("{sign}0x0.{frac:013x}p{SUBNORMAL_EXP}");
    }

    let exp = exp_bits - 1023;
    format!("{sign}0x1.{frac:013x}p{exp:+}")
}

/// Parse a hexadecimal float literal back into a double.
///
/// Accepts the forms produced by [`float_to_hex`], with shorter fraction
/// strings padded on the right (so `0x1.8p+1` parses as `3.0`).
///
/// # Errors
///
/// - `ProtocolError::FloatSyntax` on any malformed literal.
pub fn float_from_hex(text: &str) -> Result<f64> {
    let bad = || ProtocolError::FloatSyntax(text.to_string());

    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    match rest {
        "inf" | "infinity" => {
            return Ok(if negative { f64::NEG_INFINITY } else { f64::INFINITY });
        },
        "nan" => return Ok(f64::NAN),
        _ => {},
    }

    let rest = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")).ok_or_else(bad)?;
    let (mantissa_text, exp_text) =
        rest.split_once(['p', 'P']).ok_or_else(bad)?;
    let exp: i32 = exp_text.parse().map_err(|_| bad())?;

    let (int_text, frac_text) = match mantissa_text.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa_text, ""),
    };
    if int_text.is_empty() || frac_text.len() > FRAC_DIGITS {
        return Err(bad());
    }

    let int_part = u64::from_str_radix(int_text, 16).map_err(|_| bad())?;
    let frac_part = if frac_text.is_empty() {
        0
    } else {
        u64::from_str_radix(frac_text, 16).map_err(|_| bad())?
    };

    // Scale the fraction up to a fixed 52-bit field so short literals parse
    // the same as fully padded ones.
    let frac_bits = frac_part << (4 * (FRAC_DIGITS - frac_text.len()));

    // int_part is 0 or 1 for everything we emit; tolerate larger mantissas
    // by folding them into the same fixed-point form.
    let mantissa = (u128::from(int_part) << (4 * FRAC_DIGITS)) | u128::from(frac_bits);
    if mantissa == 0 {
        return Ok(if negative { -0.0 } else { 0.0 });
    }

    let magnitude = (mantissa as f64) * (2.0f64).powi(exp - 4 * FRAC_DIGITS as i32);
    Ok(if negative { -magnitude } else { magnitude })
}
