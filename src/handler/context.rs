//! Invoke context and reply types for exported handlers.
//!
//! # Example
//!
//! ```ignore
//! async fn upload(ctx: InvokeContext) -> HandlerResult {
//!     let mut total = 0;
//!     for mut file in ctx.take_files() {
//!         total += file.read_all().await?.len();
//!     }
//!     Ok(InvokeReply::new(json!(total)))
//! }
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::routing::{IncomingFile, OutgoingFile};

/// Context passed to exported handlers.
pub struct InvokeContext {
    sender: String,
    path: String,
    data: Value,
    files: Vec<IncomingFile>,
}

impl InvokeContext {
    /// Create a context.
    pub fn new(sender: String, path: String, data: Value, files: Vec<IncomingFile>) -> Self {
        Self {
            sender,
            path,
            data,
            files,
        }
    }

    /// Module that sent the request.
    #[inline]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Invoked path.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request data.
    #[inline]
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Deserialize the request data.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Files attached to the request, not yet pulled.
    pub fn files(&self) -> &[IncomingFile] {
        &self.files
    }

    /// Mutable access to the attached files.
    pub fn files_mut(&mut self) -> &mut [IncomingFile] {
        &mut self.files
    }

    /// Take ownership of the attached files.
    pub fn take_files(&mut self) -> Vec<IncomingFile> {
        std::mem::take(&mut self.files)
    }
}

impl fmt::Debug for InvokeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeContext")
            .field("sender", &self.sender)
            .field("path", &self.path)
            .field("data", &self.data)
            .field("files", &self.files.len())
            .finish()
    }
}

/// Reply produced by an exported handler.
#[derive(Default)]
pub struct InvokeReply {
    /// Response data.
    pub data: Value,
    /// Files served to the caller after the response.
    pub files: Vec<OutgoingFile>,
}

impl InvokeReply {
    /// Reply with `data` and no files.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            files: Vec::new(),
        }
    }

    /// Reply with a serialized value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Attach a file.
    pub fn with_file(mut self, file: OutgoingFile) -> Self {
        self.files.push(file);
        self
    }
}

impl fmt::Debug for InvokeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeReply")
            .field("data", &self.data)
            .field("files", &self.files.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_context_accessors() {
        let ctx = InvokeContext::new(
            "client".into(),
            "geo.point".into(),
            json!({"x": 1, "y": 2}),
            Vec::new(),
        );

        assert_eq!(ctx.sender(), "client");
        assert_eq!(ctx.path(), "geo.point");
        assert_eq!(ctx.data_as::<Point>().unwrap(), Point { x: 1, y: 2 });
        assert!(ctx.files().is_empty());
    }

    #[test]
    fn test_data_as_type_mismatch() {
        let ctx = InvokeContext::new("c".into(), "p".into(), json!("text"), Vec::new());
        assert!(ctx.data_as::<Point>().is_err());
    }

    #[test]
    fn test_reply_builders() {
        let reply = InvokeReply::json(&vec![1, 2, 3])
            .unwrap()
            .with_file(OutgoingFile::from_bytes("a.bin", Bytes::from_static(b"abc")));

        assert_eq!(reply.data, json!([1, 2, 3]));
        assert_eq!(reply.files.len(), 1);
        assert_eq!(reply.files[0].name(), "a.bin");
    }
}
