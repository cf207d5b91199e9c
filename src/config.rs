//! Configuration for a [`RemoteInvoke`](crate::RemoteInvoke) instance.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use remote_invoke::RemoteInvokeConfig;
//!
//! let config = RemoteInvokeConfig::new("server")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_report_error_stack(true);
//!
//! assert_eq!(config.module_name, "server");
//! assert_eq!(config.timeout, Some(Duration::from_secs(10)));
//! ```

use std::time::Duration;

use crate::protocol::{DEFAULT_FILE_PIECE_SIZE, DEFAULT_MAX_PATH_LENGTH};

/// Default invoke timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Default broadcast open/close retransmit interval when no timeout is set.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Default maximum concurrently running export handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Settings of one module instance.
#[derive(Debug, Clone)]
pub struct RemoteInvokeConfig {
    /// Name of this module; receivers of inbound messages must match it.
    pub module_name: String,
    /// Invoke and file-transfer timeout. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Send the handler error's debug rendering as the remote stack.
    pub report_error_stack: bool,
    /// Size of one file piece in bytes.
    pub file_piece_size: usize,
    /// Spread sends across ports instead of always using the first.
    pub load_balance: bool,
    /// Log every sent and received message.
    pub print_message: bool,
    /// Log every internal error, even when an error listener is set.
    pub print_error: bool,
    /// Maximum path length in Unicode code points.
    pub max_path_length: usize,
    /// Broadcast open/close retransmit interval used when `timeout` is `None`.
    pub retry_interval: Duration,
    /// Export handlers allowed to run at once; further requests fail.
    pub max_concurrent_handlers: usize,
}

impl RemoteInvokeConfig {
    /// Default settings for `module_name`.
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            timeout: Some(DEFAULT_TIMEOUT),
            report_error_stack: false,
            file_piece_size: DEFAULT_FILE_PIECE_SIZE,
            load_balance: true,
            print_message: false,
            print_error: false,
            max_path_length: DEFAULT_MAX_PATH_LENGTH,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }

    /// Set the timeout. A zero duration means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = normalize_timeout(timeout);
        self
    }

    /// Set whether handler error stacks are reported to callers.
    pub fn with_report_error_stack(mut self, enabled: bool) -> Self {
        self.report_error_stack = enabled;
        self
    }

    /// Set the file piece size. Zero is raised to one byte.
    pub fn with_file_piece_size(mut self, size: usize) -> Self {
        self.file_piece_size = size.max(1);
        self
    }

    /// Set whether sends are load balanced across ports.
    pub fn with_load_balance(mut self, enabled: bool) -> Self {
        self.load_balance = enabled;
        self
    }

    /// Set whether every message is logged.
    pub fn with_print_message(mut self, enabled: bool) -> Self {
        self.print_message = enabled;
        self
    }

    /// Set whether every internal error is logged.
    pub fn with_print_error(mut self, enabled: bool) -> Self {
        self.print_error = enabled;
        self
    }

    /// Set the maximum path length.
    pub fn with_max_path_length(mut self, length: usize) -> Self {
        self.max_path_length = length;
        self
    }

    /// Set the broadcast retransmit interval used without a timeout.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the handler concurrency limit. Zero is raised to one.
    pub fn with_max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit.max(1);
        self
    }

    /// Interval between broadcast open/close retransmissions.
    pub fn broadcast_retry_interval(&self) -> Duration {
        self.timeout.unwrap_or(self.retry_interval)
    }
}

/// Map a zero timeout to "no timeout".
pub(crate) fn normalize_timeout(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}
