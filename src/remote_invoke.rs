//! Public facade and its builder.
//!
//! A [`RemoteInvoke`] is one named module instance. It exports handlers,
//! invokes handlers of its peer, subscribes to the peer's broadcasts and
//! publishes its own. Everything travels over the [`ConnectionPort`]s added
//! to it; with several ports, sends are load-balanced across them.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use remote_invoke::{MemoryPort, RemoteInvoke};
//!
//! #[tokio::main]
//! async fn main() -> remote_invoke::Result<()> {
//!     let (a, b) = MemoryPort::pair();
//!
//!     let server = RemoteInvoke::builder("server")
//!         .export("add", |(x, y): (i64, i64), _ctx| async move {
//!             Ok::<_, std::io::Error>(x + y)
//!         })
//!         .port(Arc::new(a))
//!         .build()?;
//!
//!     let client = RemoteInvoke::builder("client").port(Arc::new(b)).build()?;
//!     let sum: i64 = client.invoke("server", "add", &(2, 3)).await?.data_as()?;
//!     assert_eq!(sum, 5);
//!     server.close();
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::RemoteInvokeConfig;
use crate::error::{BoxError, RemoteInvokeError, Result};
use crate::event_space::ListenerId;
use crate::handler::{ExportRegistry, HandlerResult, InvokeContext};
use crate::protocol::{check_path, BroadcastMessage};
use crate::routing::{Engine, ErrorListener, InvokeRequest, InvokeResult};
use crate::transport::ConnectionPort;

/// Builder for configuring and creating a [`RemoteInvoke`].
///
/// Exports and ports registered here are installed before the first port
/// can deliver a message.
pub struct RemoteInvokeBuilder {
    config: RemoteInvokeConfig,
    exports: ExportRegistry,
    ports: Vec<Arc<dyn ConnectionPort>>,
    error_listener: Option<ErrorListener>,
}

impl RemoteInvokeBuilder {
    /// Create a builder for module `module_name` with default settings.
    pub fn new(module_name: impl Into<String>) -> Self {
        Self::with_config(RemoteInvokeConfig::new(module_name))
    }

    /// Create a builder from a complete configuration.
    pub fn with_config(config: RemoteInvokeConfig) -> Self {
        Self {
            config,
            exports: ExportRegistry::new(),
            ports: Vec::new(),
            error_listener: None,
        }
    }

    /// Set the default invoke and file-transfer timeout.
    ///
    /// Zero disables the timeout.
    /// Default: 3 minutes
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    /// Include the handler error's debug rendering in `invoke_failed`.
    pub fn report_error_stack(mut self, enabled: bool) -> Self {
        self.config = self.config.with_report_error_stack(enabled);
        self
    }

    /// Set the size of one file piece.
    ///
    /// Default: 512 KiB
    pub fn file_piece_size(mut self, size: usize) -> Self {
        self.config = self.config.with_file_piece_size(size);
        self
    }

    /// Spread sends across ports.
    ///
    /// Default: true
    pub fn load_balance(mut self, enabled: bool) -> Self {
        self.config = self.config.with_load_balance(enabled);
        self
    }

    /// Log every sent and received message at `info`.
    pub fn print_message(mut self, enabled: bool) -> Self {
        self.config = self.config.with_print_message(enabled);
        self
    }

    /// Log internal errors even when an error listener is set.
    pub fn print_error(mut self, enabled: bool) -> Self {
        self.config = self.config.with_print_error(enabled);
        self
    }

    /// Set the maximum path length in code points.
    ///
    /// Default: 256
    pub fn max_path_length(mut self, length: usize) -> Self {
        self.config = self.config.with_max_path_length(length);
        self
    }

    /// Set the broadcast handshake retransmit period used without a timeout.
    ///
    /// Default: 3 minutes
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_retry_interval(interval);
        self
    }

    /// Set the maximum number of export handlers running at once.
    ///
    /// Requests over the limit fail immediately.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config = self.config.with_max_concurrent_handlers(limit);
        self
    }

    /// Export a typed handler at `path`.
    pub fn export<F, T, R, E, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(T, InvokeContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.exports.register(path, handler);
        self
    }

    /// Export a handler that sees the raw context and may reply with files.
    pub fn export_raw<F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(InvokeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.exports.register_raw(path, handler);
        self
    }

    /// Add a connection port.
    pub fn port(mut self, port: Arc<dyn ConnectionPort>) -> Self {
        self.ports.push(port);
        self
    }

    /// Set the internal error listener.
    pub fn on_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&RemoteInvokeError) + Send + Sync + 'static,
    {
        self.error_listener = Some(Arc::new(listener));
        self
    }

    /// Build the instance and attach its ports.
    ///
    /// # Errors
    ///
    /// Fails if an export path is too long or a port was added twice.
    pub fn build(self) -> Result<RemoteInvoke> {
        for path in self.exports.paths() {
            check_path(&path, self.config.max_path_length)?;
        }

        let engine = Engine::new(self.config);
        *engine.exports() = self.exports;
        engine.set_error_listener(self.error_listener);
        for port in self.ports {
            engine.add_port(port)?;
        }

        Ok(RemoteInvoke { engine })
    }
}

/// A module instance speaking the RemoteInvoke protocol.
///
/// Cloning is cheap; clones share the same instance.
#[derive(Clone)]
pub struct RemoteInvoke {
    engine: Arc<Engine>,
}

impl RemoteInvoke {
    /// Create an instance with no exports and no ports.
    pub fn new(config: RemoteInvokeConfig) -> Self {
        Self {
            engine: Engine::new(config),
        }
    }

    /// Create a builder for module `module_name`.
    pub fn builder(module_name: impl Into<String>) -> RemoteInvokeBuilder {
        RemoteInvokeBuilder::new(module_name)
    }

    /// Name of this module.
    pub fn module_name(&self) -> &str {
        self.engine.name()
    }

    /// Active configuration.
    pub fn config(&self) -> &RemoteInvokeConfig {
        self.engine.config()
    }

    /// Export a typed handler at `path`, replacing any previous one.
    ///
    /// The request data is deserialized into `T`; the returned `R` is
    /// serialized as the response data.
    pub fn export<F, T, R, E, Fut>(&self, path: &str, handler: F) -> Result<()>
    where
        F: Fn(T, InvokeContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        check_path(path, self.config().max_path_length)?;
        if self.engine.exports().register(path, handler) {
            tracing::debug!("Replaced export `{}`", path);
        }
        Ok(())
    }

    /// Export a handler that sees the raw context and may reply with files.
    pub fn export_raw<F, Fut>(&self, path: &str, handler: F) -> Result<()>
    where
        F: Fn(InvokeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        check_path(path, self.config().max_path_length)?;
        if self.engine.exports().register_raw(path, handler) {
            tracing::debug!("Replaced export `{}`", path);
        }
        Ok(())
    }

    /// Remove the export at `path`. Returns `false` if there was none.
    pub fn cancel_export(&self, path: &str) -> bool {
        self.engine.exports().remove(path)
    }

    /// Invoke `path` on `target` with serialized `data`.
    ///
    /// Resolves once the response and all of its files have arrived.
    ///
    /// # Errors
    ///
    /// [`RemoteInvokeError::Remote`] if the handler failed or does not
    /// exist, [`RemoteInvokeError::Timeout`] if no answer came in time,
    /// [`RemoteInvokeError::ConnectionReset`] if the connection closed,
    /// or the send error of the port.
    pub async fn invoke<T: Serialize + ?Sized>(
        &self,
        target: &str,
        path: &str,
        data: &T,
    ) -> Result<InvokeResult> {
        self.invoke_with(target, path, InvokeRequest::json(data)?).await
    }

    /// Invoke `path` on `target` with files or a custom timeout.
    pub async fn invoke_with(
        &self,
        target: &str,
        path: &str,
        request: InvokeRequest,
    ) -> Result<InvokeResult> {
        self.engine.invoke(target, path, request).await
    }

    /// Subscribe to broadcasts of `sender` at `path` and below.
    ///
    /// The first subscription on a path announces it to the peer.
    pub fn receive<F>(&self, sender: &str, path: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        self.engine.receive(sender, path, handler)
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub fn cancel_receive(&self, sender: &str, path: &str, id: ListenerId) -> bool {
        self.engine.cancel_receive(sender, path, Some(id))
    }

    /// Remove every subscription at `path`. Returns `false` if there was none.
    pub fn cancel_receive_all(&self, sender: &str, path: &str) -> bool {
        self.engine.cancel_receive(sender, path, None)
    }

    /// Publish `data` at `path`.
    ///
    /// Returns `false` without sending anything if the peer has not
    /// subscribed to `path` or one of its ancestors.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, path: &str, data: &T) -> Result<bool> {
        let data = serde_json::to_value(data)?;
        self.engine.broadcast(path, data).await
    }

    /// Route internal errors to `listener` instead of the log.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&RemoteInvokeError) + Send + Sync + 'static,
    {
        self.engine.set_error_listener(Some(Arc::new(listener)));
    }

    /// Attach a connection port.
    ///
    /// # Errors
    ///
    /// [`RemoteInvokeError::DuplicatePort`] if `port` was already added.
    pub fn add_connection_port(&self, port: Arc<dyn ConnectionPort>) -> Result<()> {
        self.engine.add_port(port)
    }

    /// Check if at least one port is open.
    pub fn connected(&self) -> bool {
        self.engine.connected()
    }

    /// Number of open ports.
    pub fn port_count(&self) -> usize {
        self.engine.ports().port_count()
    }

    /// Close every port.
    pub fn close(&self) {
        self.engine.close();
    }
}

impl std::fmt::Debug for RemoteInvoke {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteInvoke")
            .field("module_name", &self.module_name())
            .field("port_count", &self.port_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_applies_settings() {
        let ri = RemoteInvoke::builder("m")
            .timeout(Duration::ZERO)
            .file_piece_size(16)
            .load_balance(false)
            .max_concurrent_handlers(4)
            .build()
            .unwrap();

        assert_eq!(ri.module_name(), "m");
        assert_eq!(ri.config().timeout, None);
        assert_eq!(ri.config().file_piece_size, 16);
        assert!(!ri.config().load_balance);
        assert_eq!(ri.config().max_concurrent_handlers, 4);
        assert!(!ri.connected());
        assert_eq!(ri.port_count(), 0);
    }

    #[test]
    fn test_builder_rejects_long_export_path() {
        let result = RemoteInvoke::builder("m")
            .max_path_length(3)
            .export("toolong", |_: (), _ctx| async { Ok::<_, BoxError>(()) })
            .build();
        assert!(matches!(result, Err(RemoteInvokeError::Protocol(_))));
    }

    #[test]
    fn test_cancel_export_is_idempotent() {
        let ri = RemoteInvoke::new(RemoteInvokeConfig::new("m"));
        ri.export("p", |_: (), _ctx| async { Ok::<_, BoxError>(json!(1)) })
            .unwrap();

        assert!(ri.cancel_export("p"));
        assert!(!ri.cancel_export("p"));
    }

    #[test]
    fn test_cancel_receive_on_empty_path() {
        let ri = RemoteInvoke::new(RemoteInvokeConfig::new("m"));
        assert!(!ri.cancel_receive_all("peer", "topic"));
    }

    #[tokio::test]
    async fn test_invoke_without_port_fails() {
        let ri = RemoteInvoke::new(RemoteInvokeConfig::new("m"));
        let err = ri.invoke("peer", "p", &()).await.unwrap_err();
        assert!(matches!(err, RemoteInvokeError::NoAvailablePort));
    }

    #[tokio::test]
    async fn test_broadcast_without_subscriber_is_skipped() {
        let ri = RemoteInvoke::new(RemoteInvokeConfig::new("m"));
        assert!(!ri.broadcast("topic", &1).await.unwrap());
    }
}
