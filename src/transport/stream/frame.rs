//! Stream frame layout.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +----------------+----------------+-------------+-----------+
//! | header_length  | body_length    | header      | body      |
//! | u32 BE         | u32 BE         | UTF-8 JSON  | raw bytes |
//! +----------------+----------------+-------------+-----------+
//! ```
//!
//! # Example
//!
//! ```
//! use remote_invoke::transport::{FrameHeader, FRAME_HEADER_SIZE};
//!
//! let header = FrameHeader::new(7, 3);
//! let encoded = header.encode();
//! assert_eq!(encoded.len(), FRAME_HEADER_SIZE);
//! assert_eq!(FrameHeader::decode(&encoded), Some(header));
//! ```

use bytes::Bytes;

use crate::error::{RemoteInvokeError, Result};

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Default upper bound for `header_length + body_length` (1 GB).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 1024 * 1024 * 1024;

/// Length prefix of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the JSON header in bytes.
    pub header_length: u32,
    /// Length of the body in bytes.
    pub body_length: u32,
}

impl FrameHeader {
    /// Create a frame header.
    pub fn new(header_length: u32, body_length: u32) -> Self {
        Self {
            header_length,
            body_length,
        }
    }

    /// Combined length of header and body.
    #[inline]
    pub fn content_length(&self) -> u64 {
        self.header_length as u64 + self.body_length as u64
    }

    /// Encode to 8 big-endian bytes.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[..4].copy_from_slice(&self.header_length.to_be_bytes());
        buf[4..].copy_from_slice(&self.body_length.to_be_bytes());
        buf
    }

    /// Decode from the first 8 bytes. Returns `None` if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let header_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let body_length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(Self::new(header_length, body_length))
    }

    /// Build the prefix for a header and body, rejecting parts over 4 GB.
    pub fn for_parts(header: &str, body: &[u8]) -> Result<Self> {
        let header_length = u32::try_from(header.len())
            .map_err(|_| RemoteInvokeError::protocol("frame header exceeds u32 length"))?;
        let body_length = u32::try_from(body.len())
            .map_err(|_| RemoteInvokeError::protocol("frame body exceeds u32 length"))?;
        Ok(Self::new(header_length, body_length))
    }
}

/// A complete inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Message header text.
    pub header: String,
    /// Message body (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    /// Create a frame.
    pub fn new(header: String, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Split into `(header, body)`.
    pub fn into_parts(self) -> (String, Bytes) {
        (self.header, self.body)
    }
}

/// Build a complete frame as a single byte vector.
///
/// Use the writer task for scatter/gather output; this is for tests and
/// one-off writes.
pub fn build_frame(header: &str, body: &[u8]) -> Result<Vec<u8>> {
    let prefix = FrameHeader::for_parts(header, body)?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + header.len() + body.len());
    buf.extend_from_slice(&prefix.encode());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}
