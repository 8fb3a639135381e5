//! AMQP field tables and typed field values.
//!
//! Field tables carry connection properties, declare arguments and message
//! headers. A table is a u32 byte-length prefix followed by
//! (short-string key, tag octet, value) entries; the tag octet selects one of
//! the concrete types below. Encoding and decoding are exhaustive matches
//! over [`FieldValue`], and `decode(encode(t)) == t` for every well-formed
//! table.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;

use super::{CodecError, Result};

/// A field table: short-string keys mapped to typed values.
pub type FieldTable = HashMap<String, FieldValue>;

/// A typed AMQP field value.
///
/// The `s`/`u` tags follow the RabbitMQ dialect: `s` is a signed 16-bit
/// integer, not a short string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal { scale: u8, value: i32 },
    LongString(String),
    Bytes(Vec<u8>),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
}

impl FieldValue {
    /// The wire tag octet for this value.
    pub fn tag(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => b't',
            FieldValue::I8(_) => b'b',
            FieldValue::U8(_) => b'B',
            FieldValue::I16(_) => b's',
            FieldValue::U16(_) => b'u',
            FieldValue::I32(_) => b'I',
            FieldValue::U32(_) => b'i',
            FieldValue::I64(_) => b'l',
            FieldValue::F32(_) => b'f',
            FieldValue::F64(_) => b'd',
            FieldValue::Decimal { .. } => b'D',
            FieldValue::LongString(_) => b'S',
            FieldValue::Bytes(_) => b'x',
            FieldValue::Array(_) => b'A',
            FieldValue::Timestamp(_) => b'T',
            FieldValue::Table(_) => b'F',
            FieldValue::Void => b'V',
        }
    }
}

fn ensure(cursor: &Cursor<&[u8]>, needed: usize, what: &str) -> Result<()> {
    if cursor.remaining() < needed {
        return Err(CodecError::Syntax(format!(
            "truncated {}: needed {} bytes, {} available",
            what,
            needed,
            cursor.remaining()
        )));
    }
    Ok(())
}

/// Encode a short string (u8 length prefix, max 255 bytes).
pub fn encode_short_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > 255 {
        return Err(CodecError::Syntax(format!("short string too long: {} bytes", s.len())));
    }
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Decode a short string.
pub fn decode_short_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    ensure(cursor, 1, "short string length")?;
    let len = cursor.get_u8() as usize;
    ensure(cursor, len, "short string")?;
    let mut bytes = vec![0u8; len];
    cursor.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| CodecError::Syntax("short string is not UTF-8".into()))
}

/// Encode a long string (u32 length prefix).
pub fn encode_long_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Decode a long string.
pub fn decode_long_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    ensure(cursor, 4, "long string length")?;
    let len = cursor.get_u32() as usize;
    ensure(cursor, len, "long string")?;
    let mut bytes = vec![0u8; len];
    cursor.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| CodecError::Syntax("long string is not UTF-8".into()))
}

/// Encode a field table with its u32 byte-length prefix.
pub fn encode_table(buf: &mut BytesMut, table: &FieldTable) -> Result<()> {
    let mut body = BytesMut::new();
    for (key, value) in table {
        encode_short_string(&mut body, key)?;
        encode_value(&mut body, value)?;
    }
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Decode a field table from its u32 byte-length prefix.
pub fn decode_table(cursor: &mut Cursor<&[u8]>) -> Result<FieldTable> {
    ensure(cursor, 4, "table length")?;
    let len = cursor.get_u32() as usize;
    ensure(cursor, len, "table body")?;
    let end = cursor.position() + len as u64;

    let mut table = FieldTable::new();
    while cursor.position() < end {
        let key = decode_short_string(cursor)?;
        let value = decode_value(cursor)?;
        table.insert(key, value);
    }
    if cursor.position() != end {
        return Err(CodecError::Syntax("table entries overran declared length".into()));
    }
    Ok(table)
}

fn encode_value(buf: &mut BytesMut, value: &FieldValue) -> Result<()> {
    buf.put_u8(value.tag());
    match value {
        FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
        FieldValue::I8(v) => buf.put_i8(*v),
        FieldValue::U8(v) => buf.put_u8(*v),
        FieldValue::I16(v) => buf.put_i16(*v),
        FieldValue::U16(v) => buf.put_u16(*v),
        FieldValue::I32(v) => buf.put_i32(*v),
        FieldValue::U32(v) => buf.put_u32(*v),
        FieldValue::I64(v) => buf.put_i64(*v),
        FieldValue::F32(v) => buf.put_f32(*v),
        FieldValue::F64(v) => buf.put_f64(*v),
        FieldValue::Decimal { scale, value } => {
            buf.put_u8(*scale);
            buf.put_i32(*value);
        }
        FieldValue::LongString(v) => encode_long_string(buf, v),
        FieldValue::Bytes(v) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        FieldValue::Array(items) => {
            let mut body = BytesMut::new();
            for item in items {
                encode_value(&mut body, item)?;
            }
            buf.put_u32(body.len() as u32);
            buf.put_slice(&body);
        }
        FieldValue::Timestamp(v) => buf.put_u64(*v),
        FieldValue::Table(t) => encode_table(buf, t)?,
        FieldValue::Void => {}
    }
    Ok(())
}

fn decode_value(cursor: &mut Cursor<&[u8]>) -> Result<FieldValue> {
    ensure(cursor, 1, "field value tag")?;
    let tag = cursor.get_u8();
    let value = match tag {
        b't' => {
            ensure(cursor, 1, "bool")?;
            FieldValue::Bool(cursor.get_u8() != 0)
        }
        b'b' => {
            ensure(cursor, 1, "i8")?;
            FieldValue::I8(cursor.get_i8())
        }
        b'B' => {
            ensure(cursor, 1, "u8")?;
            FieldValue::U8(cursor.get_u8())
        }
        b's' => {
            ensure(cursor, 2, "i16")?;
            FieldValue::I16(cursor.get_i16())
        }
        b'u' => {
            ensure(cursor, 2, "u16")?;
            FieldValue::U16(cursor.get_u16())
        }
        b'I' => {
            ensure(cursor, 4, "i32")?;
            FieldValue::I32(cursor.get_i32())
        }
        b'i' => {
            ensure(cursor, 4, "u32")?;
            FieldValue::U32(cursor.get_u32())
        }
        b'l' => {
            ensure(cursor, 8, "i64")?;
            FieldValue::I64(cursor.get_i64())
        }
        b'f' => {
            ensure(cursor, 4, "f32")?;
            FieldValue::F32(cursor.get_f32())
        }
        b'd' => {
            ensure(cursor, 8, "f64")?;
            FieldValue::F64(cursor.get_f64())
        }
        b'D' => {
            ensure(cursor, 5, "decimal")?;
            FieldValue::Decimal { scale: cursor.get_u8(), value: cursor.get_i32() }
        }
        b'S' => FieldValue::LongString(decode_long_string(cursor)?),
        b'x' => {
            ensure(cursor, 4, "byte array length")?;
            let len = cursor.get_u32() as usize;
            ensure(cursor, len, "byte array")?;
            let mut bytes = vec![0u8; len];
            cursor.copy_to_slice(&mut bytes);
            FieldValue::Bytes(bytes)
        }
        b'A' => {
            ensure(cursor, 4, "array length")?;
            let len = cursor.get_u32() as usize;
            ensure(cursor, len, "array body")?;
            let end = cursor.position() + len as u64;
            let mut items = Vec::new();
            while cursor.position() < end {
                items.push(decode_value(cursor)?);
            }
            if cursor.position() != end {
                return Err(CodecError::Syntax("array items overran declared length".into()));
            }
            FieldValue::Array(items)
        }
        b'T' => {
            ensure(cursor, 8, "timestamp")?;
            FieldValue::Timestamp(cursor.get_u64())
        }
        b'F' => FieldValue::Table(decode_table(cursor)?),
        b'V' => FieldValue::Void,
        other => {
            return Err(CodecError::Syntax(format!("unknown field value tag 0x{:02x}", other)))
        }
    };
    Ok(value)
}
