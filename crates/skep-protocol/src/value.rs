//! Structured payloads for `LUA`-typed messages.
//!
//! A `Value` is an arbitrarily nested tree of nils, booleans, numbers,
//! strings, byte blobs, arrays, and maps. The codec is a compact tagged
//! binary format; `pack` followed by `unpack` yields a structurally equal
//! tree.

use crate::buffer::Buffer;
use crate::error::Error;

const TAG_NIL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_MAP: u8 = 0x08;

/// Nesting deeper than this fails to encode or decode.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Key/value pairs in insertion order. Keys are not deduplicated.
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Serialize into a fresh buffer with default head room.
    pub fn pack(&self) -> Result<Buffer, Error> {
        let mut buf = Buffer::new();
        self.pack_into(&mut buf)?;
        Ok(buf)
    }

    pub fn pack_into(&self, buf: &mut Buffer) -> Result<(), Error> {
        encode(self, buf, 0)
    }

    /// Deserialize a value from the front of `bytes`.
    pub fn unpack(bytes: &[u8]) -> Result<Value, Error> {
        let mut pos = 0;
        let value = decode(bytes, &mut pos, 0)?;
        Ok(value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

fn encode(value: &Value, buf: &mut Buffer, depth: usize) -> Result<(), Error> {
    if depth > MAX_DEPTH {
        return Err(Error::ValueTooDeep(MAX_DEPTH));
    }

    match value {
        Value::Nil => buf.write(&[TAG_NIL]),
        Value::Bool(false) => buf.write(&[TAG_FALSE]),
        Value::Bool(true) => buf.write(&[TAG_TRUE]),
        Value::Int(n) => {
            buf.write(&[TAG_INT]);
            buf.write(&n.to_le_bytes());
        }
        Value::Float(f) => {
            buf.write(&[TAG_FLOAT]);
            buf.write(&f.to_le_bytes());
        }
        Value::Str(s) => {
            buf.write(&[TAG_STR]);
            buf.write(&(s.len() as u32).to_le_bytes());
            buf.write(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.write(&[TAG_BYTES]);
            buf.write(&(b.len() as u32).to_le_bytes());
            buf.write(b);
        }
        Value::Array(items) => {
            buf.write(&[TAG_ARRAY]);
            buf.write(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode(item, buf, depth + 1)?;
            }
        }
        Value::Map(pairs) => {
            buf.write(&[TAG_MAP]);
            buf.write(&(pairs.len() as u32).to_le_bytes());
            for (k, v) in pairs {
                encode(k, buf, depth + 1)?;
                encode(v, buf, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], Error> {
    if bytes.len() - *pos < n {
        return Err(Error::BufferTooSmall(n, bytes.len() - *pos));
    }
    let out = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

fn take_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, Error> {
    let raw = take(bytes, pos, 4)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn decode(bytes: &[u8], pos: &mut usize, depth: usize) -> Result<Value, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::ValueTooDeep(MAX_DEPTH));
    }

    let tag = take(bytes, pos, 1)?[0];
    match tag {
        TAG_NIL => Ok(Value::Nil),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            let raw = take(bytes, pos, 8)?;
            let mut le = [0u8; 8];
            le.copy_from_slice(raw);
            Ok(Value::Int(i64::from_le_bytes(le)))
        }
        TAG_FLOAT => {
            let raw = take(bytes, pos, 8)?;
            let mut le = [0u8; 8];
            le.copy_from_slice(raw);
            Ok(Value::Float(f64::from_le_bytes(le)))
        }
        TAG_STR => {
            let len = take_u32(bytes, pos)? as usize;
            let raw = take(bytes, pos, len)?;
            let s = std::str::from_utf8(raw).map_err(|_| Error::InvalidText)?;
            Ok(Value::Str(s.to_string()))
        }
        TAG_BYTES => {
            let len = take_u32(bytes, pos)? as usize;
            Ok(Value::Bytes(take(bytes, pos, len)?.to_vec()))
        }
        TAG_ARRAY => {
            let count = take_u32(bytes, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode(bytes, pos, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        TAG_MAP => {
            let count = take_u32(bytes, pos)? as usize;
            let mut pairs = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let k = decode(bytes, pos, depth + 1)?;
                let v = decode(bytes, pos, depth + 1)?;
                pairs.push((k, v));
            }
            Ok(Value::Map(pairs))
        }
        other => Err(Error::UnknownValueTag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let buf = value.pack().unwrap();
        let decoded = Value::unpack(buf.as_slice()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::Nil);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Int(-42));
        round_trip(Value::Int(i64::MAX));
        round_trip(Value::Float(3.5));
        round_trip(Value::Str("héllo".to_string()));
        round_trip(Value::Bytes(vec![0, 255, 1, 2]));
    }

    #[test]
    fn nested_structure_round_trips() {
        round_trip(Value::Map(vec![
            (
                Value::Str("list".into()),
                Value::Array(vec![Value::Int(1), Value::Nil, Value::Bool(true)]),
            ),
            (
                Value::Int(9),
                Value::Map(vec![(Value::Str("inner".into()), Value::Float(0.25))]),
            ),
        ]));
    }

    #[test]
    fn truncated_input_fails() {
        let buf = Value::Str("abcdef".to_string()).pack().unwrap();
        let bytes = buf.as_slice();
        assert!(Value::unpack(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn depth_limit_enforced() {
        let mut value = Value::Int(0);
        for _ in 0..40 {
            value = Value::Array(vec![value]);
        }
        assert!(value.pack().is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(Value::unpack(&[0x7F]).is_err());
    }
}
