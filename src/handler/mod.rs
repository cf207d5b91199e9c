//! Handler module - exported functions and their dispatch.
//!
//! Provides:
//! - [`ExportRegistry`] - maps invoke paths to handlers
//! - [`InvokeContext`] - request data, caller identity and attached files
//! - [`InvokeReply`] - response data plus files to serve back
//!
//! # Example
//!
//! ```ignore
//! use remote_invoke::handler::{InvokeContext, InvokeReply};
//!
//! // Typed handler: data is deserialized, the result serialized.
//! remote.export("echo", |text: String, _ctx: InvokeContext| async move {
//!     Ok::<_, BoxError>(text)
//! });
//!
//! // Raw handler: full control over the reply, including files.
//! remote.export_raw("report", |_ctx: InvokeContext| async move {
//!     Ok(InvokeReply::new(json!("ok")).with_file(OutgoingFile::from_bytes("r.csv", csv)))
//! });
//! ```

mod context;
mod registry;

pub use context::{InvokeContext, InvokeReply};
pub use registry::{
    BoxFuture, ExportHandler, ExportRegistry, HandlerResult, RawHandler, TypedHandler,
};
