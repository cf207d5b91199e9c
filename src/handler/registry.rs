//! Export registry mapping invoke paths to handlers.
//!
//! At most one handler is exported per path; exporting again replaces it.
//!
//! # Example
//!
//! ```
//! use remote_invoke::handler::{ExportRegistry, InvokeContext};
//! use remote_invoke::BoxError;
//!
//! let mut registry = ExportRegistry::new();
//! registry.register("math.add", |args: (i64, i64), _ctx: InvokeContext| async move {
//!     Ok::<_, BoxError>(args.0 + args.1)
//! });
//!
//! assert!(registry.contains("math.add"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{InvokeContext, InvokeReply};
use crate::error::BoxError;

/// Result type for export handlers.
pub type HandlerResult = std::result::Result<InvokeReply, BoxError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for exported handlers.
pub trait ExportHandler: Send + Sync + 'static {
    /// Handle one invoke request.
    fn call(&self, ctx: InvokeContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the request data and serializes the result.
pub struct TypedHandler<F, T, R, E, Fut>
where
    F: Fn(T, InvokeContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (Fut, R, E)>,
}

impl<F, T, R, E, Fut> TypedHandler<F, T, R, E, Fut>
where
    F: Fn(T, InvokeContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, E, Fut> ExportHandler for TypedHandler<F, T, R, E, Fut>
where
    F: Fn(T, InvokeContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    fn call(&self, ctx: InvokeContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match serde_json::from_value(ctx.data().clone()) {
            Ok(v) => v,
            Err(e) => {
                let err: HandlerResult = Err(e.into());
                return Box::pin(async move { err });
            }
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let value = fut.await.map_err(Into::<BoxError>::into)?;
            let data = serde_json::to_value(value)?;
            HandlerResult::Ok(InvokeReply::new(data))
        })
    }
}

/// Handler that receives the raw context and builds its own reply.
pub struct RawHandler<F, Fut>
where
    F: Fn(InvokeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
}

impl<F, Fut> RawHandler<F, Fut>
where
    F: Fn(InvokeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new raw handler.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> ExportHandler for RawHandler<F, Fut>
where
    F: Fn(InvokeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: InvokeContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(ctx))
    }
}

/// Registry mapping invoke paths to exported handlers.
#[derive(Default)]
pub struct ExportRegistry {
    handlers: HashMap<String, Arc<dyn ExportHandler>>,
}

impl ExportRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Export a handler at `path`, replacing any previous one.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn insert(&mut self, path: &str, handler: Arc<dyn ExportHandler>) -> bool {
        let replaced = self.handlers.insert(path.to_string(), handler).is_some();
        if replaced {
            tracing::debug!("Replaced export `{}`", path);
        }
        replaced
    }

    /// Export a typed handler.
    pub fn register<F, T, R, E, Fut>(&mut self, path: &str, handler: F) -> bool
    where
        F: Fn(T, InvokeContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.insert(path, Arc::new(TypedHandler::new(handler)))
    }

    /// Export a raw handler.
    pub fn register_raw<F, Fut>(&mut self, path: &str, handler: F) -> bool
    where
        F: Fn(InvokeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(path, Arc::new(RawHandler::new(handler)))
    }

    /// Remove the handler at `path`. Returns `false` if none was exported.
    pub fn remove(&mut self, path: &str) -> bool {
        self.handlers.remove(path).is_some()
    }

    /// Get the handler exported at `path`.
    pub fn get(&self, path: &str) -> Option<Arc<dyn ExportHandler>> {
        self.handlers.get(path).cloned()
    }

    /// Check if a handler is exported at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.handlers.contains_key(path)
    }

    /// Number of exported paths.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if nothing is exported.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Exported paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.handlers.keys().cloned().collect();
        paths.sort();
        paths
    }
}
