//! Opaque pagination cursors.
//!
//! A cursor carries the sort-key tuple of the last row on a page. The payload
//! is a versioned, tagged binary encoding followed by a CRC32 of the payload,
//! wrapped in URL-safe base64 without padding. Floats travel as raw bits, so
//! `decode_cursor(&encode_cursor(keys)) == keys` holds for every value,
//! including NaN and negative zero.
#![forbid(unsafe_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

use crate::query::value::Value;

const CURSOR_VERSION: u8 = 1;
const MAX_LIST_DEPTH: usize = 8;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_TIMESTAMP: u8 = 5;
const TAG_LIST: u8 = 6;

/// Reasons a cursor string is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// Not valid URL-safe base64.
    #[error("cursor is not valid base64: {0}")]
    Encoding(String),
    /// Payload ended early.
    #[error("cursor payload is truncated")]
    Truncated,
    /// Produced by an incompatible encoder.
    #[error("unsupported cursor version {0}")]
    UnsupportedVersion(u8),
    /// Unknown value tag.
    #[error("unknown value tag {0} in cursor")]
    UnknownTag(u8),
    /// CRC mismatch; the cursor was altered or corrupted.
    #[error("cursor checksum mismatch")]
    Checksum,
    /// Bytes left over after the last value.
    #[error("cursor has trailing bytes")]
    TrailingBytes,
    /// Lists nested too deeply.
    #[error("cursor values nest deeper than {MAX_LIST_DEPTH} levels")]
    TooDeep,
    /// String payload is not UTF-8.
    #[error("cursor string is not valid UTF-8")]
    InvalidUtf8,
}

/// Encodes a sort-key tuple into an opaque cursor string.
pub fn encode_cursor(keys: &[Value]) -> String {
    let mut buf = Vec::with_capacity(16 + keys.len() * 9);
    buf.push(CURSOR_VERSION);
    write_len(&mut buf, keys.len());
    for key in keys {
        write_value(&mut buf, key);
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    URL_SAFE_NO_PAD.encode(buf)
}

/// Decodes a cursor string back into its sort-key tuple.
pub fn decode_cursor(cursor: &str) -> Result<Vec<Value>, CursorError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|err| CursorError::Encoding(err.to_string()))?;
    if bytes.len() < 5 {
        return Err(CursorError::Truncated);
    }
    let (payload, crc) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if crc32fast::hash(payload) != expected {
        return Err(CursorError::Checksum);
    }
    let mut reader = Reader { buf: payload, pos: 0 };
    let version = reader.u8()?;
    if version != CURSOR_VERSION {
        return Err(CursorError::UnsupportedVersion(version));
    }
    let count = reader.len()?;
    let mut keys = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        keys.push(reader.value(0)?);
    }
    if reader.pos != payload.len() {
        return Err(CursorError::TrailingBytes);
    }
    Ok(keys)
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u32).to_le_bytes());
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*v));
        }
        Value::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Value::String(v) => {
            buf.push(TAG_STRING);
            write_len(buf, v.len());
            buf.extend_from_slice(v.as_bytes());
        }
        Value::Timestamp(v) => {
            buf.push(TAG_TIMESTAMP);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::List(items) => {
            buf.push(TAG_LIST);
            write_len(buf, items.len());
            for item in items {
                write_value(buf, item);
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CursorError> {
        let end = self.pos.checked_add(n).ok_or(CursorError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CursorError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.take(1)?[0])
    }

    fn array8(&mut self) -> Result<[u8; 8], CursorError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(out)
    }

    fn len(&mut self) -> Result<usize, CursorError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw) as usize)
    }

    fn value(&mut self, depth: usize) -> Result<Value, CursorError> {
        match self.u8()? {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => match self.u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(CursorError::UnknownTag(other)),
            },
            TAG_INT => Ok(Value::Int(i64::from_le_bytes(self.array8()?))),
            TAG_FLOAT => Ok(Value::Float(f64::from_bits(u64::from_le_bytes(self.array8()?)))),
            TAG_STRING => {
                let len = self.len()?;
                let bytes = self.take(len)?;
                String::from_utf8(bytes.to_vec())
                    .map(Value::String)
                    .map_err(|_| CursorError::InvalidUtf8)
            }
            TAG_TIMESTAMP => Ok(Value::Timestamp(i64::from_le_bytes(self.array8()?))),
            TAG_LIST => {
                if depth >= MAX_LIST_DEPTH {
                    return Err(CursorError::TooDeep);
                }
                let count = self.len()?;
                let mut items = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            other => Err(CursorError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_edge_values() {
        let keys = vec![
            Value::Float(-0.0),
            Value::Float(f64::NAN),
            Value::from("ünïcode"),
            Value::Timestamp(i64::MIN),
            Value::Null,
            Value::List(vec![Value::Int(1), Value::Bool(false)]),
        ];
        let cursor = encode_cursor(&keys);
        assert!(cursor
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        let decoded = decode_cursor(&cursor).expect("decodes");
        assert_eq!(decoded, keys);
        match decoded[0] {
            Value::Float(v) => assert!(v.is_sign_negative()),
            ref other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn tampering_is_detected() {
        let cursor = encode_cursor(&[Value::Int(42)]);
        let mut bytes = URL_SAFE_NO_PAD.decode(&cursor).expect("base64");
        bytes[6] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);
        assert_eq!(decode_cursor(&tampered), Err(CursorError::Checksum));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode_cursor("not base64!"), Err(CursorError::Encoding(_))));
        assert_eq!(decode_cursor("AAAA"), Err(CursorError::Truncated));
    }

    #[test]
    fn empty_tuple_round_trips() {
        assert_eq!(decode_cursor(&encode_cursor(&[])).expect("decodes"), Vec::<Value>::new());
    }
}
