//! Wire format helpers.
//!
//! Every message travels as a `(header, body)` pair:
//!
//! ```text
//! header: JSON array  [type, sender, receiver|null, path?]
//! body:   JSON array  (all variants except invoke_file_response)
//!
//! invoke_file_response body:
//! ┌──────────────────┬───────────────┬─────────────────┐
//! │ preamble length  │ JSON preamble │ raw file bytes  │
//! │ 4 bytes uint32 BE│ N bytes       │ rest of body    │
//! └──────────────────┴───────────────┴─────────────────┘
//! ```
//!
//! Numeric identifiers must be safe non-negative integers (at most
//! 2^53 - 1) so that JavaScript peers can represent them exactly.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{RemoteInvokeError, Result};

/// Largest integer a JSON peer can represent exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Default maximum path length, in Unicode code points.
pub const DEFAULT_MAX_PATH_LENGTH: usize = 256;

/// Default size of one file piece (512 KiB).
pub const DEFAULT_FILE_PIECE_SIZE: usize = 512 * 1024;

/// Size of the preamble length prefix in a file response body.
pub const PREAMBLE_LENGTH_SIZE: usize = 4;

/// Separator of broadcast path segments.
pub const PATH_SEPARATOR: char = '.';

/// Positional accessor over a decoded JSON array.
///
/// Used for both headers and bodies; every accessor names the field it
/// reads so decode errors point at the offending value.
#[derive(Debug)]
pub struct FieldReader {
    values: Vec<Value>,
    what: &'static str,
}

impl FieldReader {
    /// Parse a JSON array.
    pub fn from_slice(bytes: &[u8], what: &'static str) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            RemoteInvokeError::protocol(format!("{} is not valid JSON: {}", what, e))
        })?;
        match value {
            Value::Array(values) => Ok(Self { values, what }),
            _ => Err(RemoteInvokeError::protocol(format!(
                "{} must be a JSON array",
                what
            ))),
        }
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn get(&self, index: usize, name: &str) -> Result<&Value> {
        self.values.get(index).ok_or_else(|| {
            RemoteInvokeError::protocol(format!("{} is missing field `{}`", self.what, name))
        })
    }

    /// Read a required string.
    pub fn string(&self, index: usize, name: &str) -> Result<String> {
        match self.get(index, name)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(self.type_error(name, "a string", other)),
        }
    }

    /// Read a string that may be `null` or absent.
    pub fn opt_string(&self, index: usize, name: &str) -> Result<Option<String>> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.type_error(name, "a string or null", other)),
        }
    }

    /// Read a required safe non-negative integer.
    pub fn integer(&self, index: usize, name: &str) -> Result<u64> {
        safe_integer(self.get(index, name)?, name)
    }

    /// Read a safe non-negative integer that may be `null` or absent.
    pub fn opt_integer(&self, index: usize, name: &str) -> Result<Option<u64>> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => safe_integer(v, name).map(Some),
        }
    }

    /// Read a required boolean.
    pub fn boolean(&self, index: usize, name: &str) -> Result<bool> {
        match self.get(index, name)? {
            Value::Bool(b) => Ok(*b),
            other => Err(self.type_error(name, "a boolean", other)),
        }
    }

    /// Take an arbitrary value, leaving `null` behind. Absent fields read as `null`.
    pub fn take(&mut self, index: usize) -> Value {
        self.values
            .get_mut(index)
            .map(Value::take)
            .unwrap_or(Value::Null)
    }

    fn type_error(&self, name: &str, expected: &str, got: &Value) -> RemoteInvokeError {
        RemoteInvokeError::protocol(format!(
            "{} field `{}` must be {}, got {}",
            self.what, name, expected, got
        ))
    }
}

/// Validate a JSON value as a safe non-negative integer.
pub fn safe_integer(value: &Value, name: &str) -> Result<u64> {
    match value.as_u64() {
        Some(n) if n <= MAX_SAFE_INTEGER => Ok(n),
        _ => Err(RemoteInvokeError::protocol(format!(
            "field `{}` must be a safe non-negative integer, got {}",
            name, value
        ))),
    }
}

/// Validate a path against the configured length limit.
pub fn check_path(path: &str, max_length: usize) -> Result<()> {
    let length = path.chars().count();
    if length > max_length {
        return Err(RemoteInvokeError::protocol(format!(
            "path length {} exceeds maximum {}",
            length, max_length
        )));
    }
    Ok(())
}

/// Split a dot-separated broadcast path into segments.
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(PATH_SEPARATOR)
}

/// Number of pieces a source of `size` bytes is split into.
#[inline]
pub fn split_number(size: u64, piece_size: usize) -> u64 {
    let piece = piece_size.max(1) as u64;
    size.div_ceil(piece)
}

/// Encode a header array to its string form.
pub fn encode_header(fields: Vec<Value>) -> Result<String> {
    Ok(serde_json::to_string(&Value::Array(fields))?)
}

/// Encode a body array to bytes.
pub fn encode_body(fields: Vec<Value>) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(&Value::Array(fields))?))
}

/// Encode a file response body: length-prefixed JSON preamble then raw bytes.
pub fn encode_file_body(preamble: Vec<Value>, data: &[u8]) -> Result<Bytes> {
    let json = serde_json::to_vec(&Value::Array(preamble))?;
    let length = u32::try_from(json.len())
        .map_err(|_| RemoteInvokeError::protocol("file preamble too large"))?;

    let mut buf = BytesMut::with_capacity(PREAMBLE_LENGTH_SIZE + json.len() + data.len());
    buf.put_u32(length);
    buf.put_slice(&json);
    buf.put_slice(data);
    Ok(buf.freeze())
}

/// Decode a file response body into its preamble fields and raw bytes.
///
/// The returned bytes share memory with `body`.
pub fn decode_file_body(body: &Bytes) -> Result<(FieldReader, Bytes)> {
    if body.len() < PREAMBLE_LENGTH_SIZE {
        return Err(RemoteInvokeError::protocol(
            "file response body shorter than its length prefix",
        ));
    }
    let length = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let end = PREAMBLE_LENGTH_SIZE
        .checked_add(length)
        .filter(|end| *end <= body.len())
        .ok_or_else(|| {
            RemoteInvokeError::protocol(format!(
                "file preamble length {} exceeds body of {} bytes",
                length,
                body.len()
            ))
        })?;

    let preamble = FieldReader::from_slice(&body[PREAMBLE_LENGTH_SIZE..end], "file preamble")?;
    Ok((preamble, body.slice(end..)))
}
