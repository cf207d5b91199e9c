//! Transport module - the connection port boundary.
//!
//! A [`ConnectionPort`] is one physical duplex channel carrying
//! `(header, body)` pairs. The protocol engine assigns its callbacks through
//! [`ConnectionPort::bind`]; the transport must fire `on_open` before any
//! `on_message` and `on_close` at most once.
//!
//! Two transports are provided:
//! - [`MemoryPort`] - in-process connected pairs
//! - [`StreamPort`] - length-prefixed frames over any `AsyncRead + AsyncWrite`

mod memory;
mod stream;

pub use memory::MemoryPort;
pub use stream::{
    build_frame, Frame, FrameBuffer, FrameHeader, StreamPort, StreamPortConfig,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SEND_TIMEOUT, FRAME_HEADER_SIZE,
};

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::handler::BoxFuture;

/// Callback invoked when a port opens or closes.
pub type PortEventFn = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked for every inbound `(header, body)` pair.
pub type PortMessageFn = Arc<dyn Fn(String, Bytes) + Send + Sync>;

/// Callbacks the engine assigns to a port.
#[derive(Clone)]
pub struct PortCallbacks {
    /// The port became connected.
    pub on_open: PortEventFn,
    /// The port disconnected. Fired at most once.
    pub on_close: PortEventFn,
    /// A message arrived.
    pub on_message: PortMessageFn,
}

impl PortCallbacks {
    /// Callbacks that ignore every event.
    pub fn noop() -> Self {
        Self {
            on_open: Arc::new(|| {}),
            on_close: Arc::new(|| {}),
            on_message: Arc::new(|_, _| {}),
        }
    }
}

/// One physical duplex byte channel.
pub trait ConnectionPort: Send + Sync + 'static {
    /// Transmit one message. Resolves once the bytes are written.
    fn send(&self, header: String, body: Bytes) -> BoxFuture<'static, Result<()>>;

    /// Close the channel. Fires `on_close` if it was open.
    fn close(&self);

    /// Check if the channel is currently open.
    fn connected(&self) -> bool;

    /// Assign the engine's callbacks, replacing any previous ones.
    fn bind(&self, callbacks: PortCallbacks);
}
