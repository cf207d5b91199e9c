//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForPrefix`: Need at least 8 bytes
//! - `WaitingForContent`: Prefix parsed, need header + body bytes
//!
//! # Example
//!
//! ```
//! use remote_invoke::transport::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&[0, 0, 0, 2]).unwrap();
//! assert!(frames.is_empty());
//!
//! let frames = buffer.push(&[0, 0, 0, 1, b'[', b']', b'x']).unwrap();
//! assert_eq!(frames[0].header, "[]");
//! assert_eq!(&frames[0].body[..], b"x");
//! ```

use bytes::BytesMut;

use super::frame::{Frame, FrameHeader, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use crate::error::{RemoteInvokeError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for the complete 8-byte prefix.
    WaitingForPrefix,
    /// Prefix parsed, waiting for header and body bytes.
    WaitingForContent { prefix: FrameHeader },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed header + body size.
    max_frame_size: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame: 1GB.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max frame size.
    pub fn with_max_frame_size(max_frame_size: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForPrefix,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a frame exceeds the max size; the stream is out of
    /// sync and the buffer should be discarded. A frame whose header is not
    /// valid UTF-8 is dropped and parsing continues with the next frame.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let Some(prefix) = FrameHeader::decode(&self.buffer) else {
                        return Ok(None);
                    };

                    if prefix.content_length() > self.max_frame_size {
                        return Err(RemoteInvokeError::Protocol(format!(
                            "Frame size {} exceeds maximum {}",
                            prefix.content_length(),
                            self.max_frame_size
                        )));
                    }

                    let _ = self.buffer.split_to(FRAME_HEADER_SIZE);
                    self.state = State::WaitingForContent { prefix };
                }

                State::WaitingForContent { prefix } => {
                    let header_len = prefix.header_length as usize;
                    let body_len = prefix.body_length as usize;
                    if self.buffer.len() < header_len + body_len {
                        return Ok(None);
                    }

                    let header = self.buffer.split_to(header_len);
                    let body = self.buffer.split_to(body_len).freeze();
                    self.state = State::WaitingForPrefix;

                    match String::from_utf8(header.to_vec()) {
                        Ok(header) => return Ok(Some(Frame::new(header, body))),
                        Err(_) => {
                            tracing::warn!(
                                "Dropping frame with non UTF-8 header ({} bytes)",
                                header_len
                            );
                        }
                    }
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForPrefix;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForPrefix => "WaitingForPrefix",
            State::WaitingForContent { .. } => "WaitingForContent",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
