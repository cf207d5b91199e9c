//! Error types for remote-invoke.

use thiserror::Error;

/// Boxed error returned by exported handlers and file producers.
///
/// Its `Display` output becomes the remote `error` string, its `Debug`
/// output the optional stack.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for all remote-invoke operations.
#[derive(Debug, Error)]
pub enum RemoteInvokeError {
    /// I/O error from a byte-stream transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed header/body, wrong receiver or oversized path.
    ///
    /// Never answered on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote module reported a failure.
    #[error("{message}")]
    Remote {
        /// Error message reported by the peer.
        message: String,
        /// Stack reported by the peer, if it is configured to send one.
        stack: Option<String>,
    },

    /// No response or file chunk arrived within the configured window.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The underlying connection port failed to send.
    #[error("Transport error: {0}")]
    Transport(String),

    /// `send` was attempted with zero open connection ports.
    #[error("No available connection port")]
    NoAvailablePort,

    /// The logical connection closed while an exchange was pending.
    #[error("Connection reset")]
    ConnectionReset,

    /// A port was closed and can no longer send.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A response arrived from a module other than the one invoked.
    #[error("Response sender mismatch: expected `{expected}`, got `{actual}`")]
    SenderMismatch {
        /// The module the request was sent to.
        expected: String,
        /// The module the response claims to come from.
        actual: String,
    },

    /// A file transfer violated the pull protocol.
    #[error("File transfer error: {0}")]
    FileTransfer(String),

    /// The same port instance was added twice.
    #[error("Connection port already added")]
    DuplicatePort,
}

impl RemoteInvokeError {
    /// Shorthand for a [`RemoteInvokeError::Protocol`] error.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this error was reported by the remote module.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Result type alias using RemoteInvokeError.
pub type Result<T> = std::result::Result<T, RemoteInvokeError>;
