//! Typed messages and their `(header, body)` encoding.
//!
//! Records are created, packed and discarded per call. Parsing validates
//! the receiver, path length and every numeric field before a record is
//! handed to the routing engine.
//!
//! # Example
//!
//! ```
//! use remote_invoke::protocol::{InvokeFinishMessage, Message};
//!
//! let msg = Message::InvokeFinish(InvokeFinishMessage {
//!     sender: "client".into(),
//!     receiver: "server".into(),
//!     response_message_id: 7,
//! });
//! let (header, body) = msg.pack().unwrap();
//! let parsed = Message::parse("server", &header, &body, 256).unwrap();
//! assert_eq!(parsed, msg);
//! ```

use std::fmt;

use bytes::Bytes;
use serde_json::{json, Value};

use super::message_type::MessageType;
use super::wire_format::{
    check_path, decode_file_body, encode_body, encode_file_body, encode_header, safe_integer,
    FieldReader,
};
use crate::error::{RemoteInvokeError, Result};

/// Description of a file attached to an invoke request or response.
///
/// `size` and `split_number` are `None` when the sender streams the file
/// without knowing its length in advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// File id, unique within its message.
    pub id: u64,
    /// Total size in bytes.
    pub size: Option<u64>,
    /// Number of pieces (`ceil(size / file_piece_size)`).
    pub split_number: Option<u64>,
    /// File name.
    pub name: String,
}

impl FileDescriptor {
    fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "size": self.size,
            "splitNumber": self.split_number,
            "name": self.name,
        })
    }

    fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| RemoteInvokeError::protocol("file descriptor must be an object"))?;

        let nullable = |key: &str| -> Result<Option<u64>> {
            match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => safe_integer(v, key).map(Some),
            }
        };

        let id = object
            .get("id")
            .ok_or_else(|| RemoteInvokeError::protocol("file descriptor is missing `id`"))
            .and_then(|v| safe_integer(v, "id"))?;
        let name = match object.get("name") {
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(RemoteInvokeError::protocol(
                    "file descriptor `name` must be a string",
                ))
            }
        };

        Ok(Self {
            id,
            size: nullable("size")?,
            split_number: nullable("splitNumber")?,
            name,
        })
    }
}

fn files_to_value(files: &[FileDescriptor]) -> Value {
    Value::Array(files.iter().map(FileDescriptor::to_value).collect())
}

fn files_from_value(value: &Value) -> Result<Vec<FileDescriptor>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(FileDescriptor::from_value).collect(),
        _ => Err(RemoteInvokeError::protocol("files must be an array")),
    }
}

/// Invoke an exported method on `receiver`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequestMessage {
    pub sender: String,
    pub receiver: String,
    pub path: String,
    pub request_message_id: u64,
    pub data: Value,
    pub files: Vec<FileDescriptor>,
}

/// Successful result of an invoke.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResponseMessage {
    pub sender: String,
    pub receiver: String,
    pub request_message_id: u64,
    /// Id under which the response's files are served.
    pub response_message_id: u64,
    pub data: Value,
    pub files: Vec<FileDescriptor>,
}

/// The caller is done pulling the response's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFinishMessage {
    pub sender: String,
    pub receiver: String,
    pub response_message_id: u64,
}

/// The invoke failed on the callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFailedMessage {
    pub sender: String,
    pub receiver: String,
    pub request_message_id: u64,
    pub error: String,
    pub stack: Option<String>,
}

/// Pull piece `index` of file `id` declared by message `message_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFileRequestMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
    pub id: u64,
    pub index: u64,
}

/// One piece of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFileResponseMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
    pub id: u64,
    pub index: u64,
    pub data: Bytes,
}

/// The file can no longer be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFileFailedMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
    pub id: u64,
    pub error: String,
}

/// The file has no more data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeFileFinishMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
    pub id: u64,
}

/// Publish `data` under a dot-separated `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub sender: String,
    pub path: String,
    pub data: Value,
}

/// Ask `receiver` to start sending broadcasts of `broadcast_sender` under `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOpenMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
    pub broadcast_sender: String,
    pub path: String,
}

/// Acknowledge a [`BroadcastOpenMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOpenFinishMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
}

/// Ask `receiver` to stop sending broadcasts under `path`.
///
/// With `include_ancestor`, every ancestor path is forgotten too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastCloseMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
    pub broadcast_sender: String,
    pub path: String,
    pub include_ancestor: bool,
}

/// Acknowledge a [`BroadcastCloseMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastCloseFinishMessage {
    pub sender: String,
    pub receiver: String,
    pub message_id: u64,
}

/// Every message that can travel on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    InvokeRequest(InvokeRequestMessage),
    InvokeResponse(InvokeResponseMessage),
    InvokeFinish(InvokeFinishMessage),
    InvokeFailed(InvokeFailedMessage),
    InvokeFileRequest(InvokeFileRequestMessage),
    InvokeFileResponse(InvokeFileResponseMessage),
    InvokeFileFailed(InvokeFileFailedMessage),
    InvokeFileFinish(InvokeFileFinishMessage),
    Broadcast(BroadcastMessage),
    BroadcastOpen(BroadcastOpenMessage),
    BroadcastOpenFinish(BroadcastOpenFinishMessage),
    BroadcastClose(BroadcastCloseMessage),
    BroadcastCloseFinish(BroadcastCloseFinishMessage),
}

impl Message {
    /// Message type tag.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::InvokeRequest(_) => MessageType::InvokeRequest,
            Message::InvokeResponse(_) => MessageType::InvokeResponse,
            Message::InvokeFinish(_) => MessageType::InvokeFinish,
            Message::InvokeFailed(_) => MessageType::InvokeFailed,
            Message::InvokeFileRequest(_) => MessageType::InvokeFileRequest,
            Message::InvokeFileResponse(_) => MessageType::InvokeFileResponse,
            Message::InvokeFileFailed(_) => MessageType::InvokeFileFailed,
            Message::InvokeFileFinish(_) => MessageType::InvokeFileFinish,
            Message::Broadcast(_) => MessageType::Broadcast,
            Message::BroadcastOpen(_) => MessageType::BroadcastOpen,
            Message::BroadcastOpenFinish(_) => MessageType::BroadcastOpenFinish,
            Message::BroadcastClose(_) => MessageType::BroadcastClose,
            Message::BroadcastCloseFinish(_) => MessageType::BroadcastCloseFinish,
        }
    }

    /// Sending module.
    pub fn sender(&self) -> &str {
        match self {
            Message::InvokeRequest(m) => &m.sender,
            Message::InvokeResponse(m) => &m.sender,
            Message::InvokeFinish(m) => &m.sender,
            Message::InvokeFailed(m) => &m.sender,
            Message::InvokeFileRequest(m) => &m.sender,
            Message::InvokeFileResponse(m) => &m.sender,
            Message::InvokeFileFailed(m) => &m.sender,
            Message::InvokeFileFinish(m) => &m.sender,
            Message::Broadcast(m) => &m.sender,
            Message::BroadcastOpen(m) => &m.sender,
            Message::BroadcastOpenFinish(m) => &m.sender,
            Message::BroadcastClose(m) => &m.sender,
            Message::BroadcastCloseFinish(m) => &m.sender,
        }
    }

    /// Receiving module, for receiver-bearing variants.
    pub fn receiver(&self) -> Option<&str> {
        match self {
            Message::InvokeRequest(m) => Some(&m.receiver),
            Message::InvokeResponse(m) => Some(&m.receiver),
            Message::InvokeFinish(m) => Some(&m.receiver),
            Message::InvokeFailed(m) => Some(&m.receiver),
            Message::InvokeFileRequest(m) => Some(&m.receiver),
            Message::InvokeFileResponse(m) => Some(&m.receiver),
            Message::InvokeFileFailed(m) => Some(&m.receiver),
            Message::InvokeFileFinish(m) => Some(&m.receiver),
            Message::Broadcast(_) => None,
            Message::BroadcastOpen(m) => Some(&m.receiver),
            Message::BroadcastOpenFinish(m) => Some(&m.receiver),
            Message::BroadcastClose(m) => Some(&m.receiver),
            Message::BroadcastCloseFinish(m) => Some(&m.receiver),
        }
    }

    /// Path, for variants that carry one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Message::InvokeRequest(m) => Some(&m.path),
            Message::Broadcast(m) => Some(&m.path),
            Message::BroadcastOpen(m) => Some(&m.path),
            Message::BroadcastClose(m) => Some(&m.path),
            _ => None,
        }
    }

    /// Encode to `(header, body)`.
    pub fn pack(&self) -> Result<(String, Bytes)> {
        let ty = json!(self.message_type().ordinal());
        let sender = json!(self.sender());
        let receiver = self.receiver().map_or(Value::Null, |r| json!(r));

        let mut header = vec![ty, sender, receiver];
        if let Some(path) = self.path() {
            // broadcast_open/close carry their path in the body
            if matches!(self, Message::InvokeRequest(_) | Message::Broadcast(_)) {
                header.push(json!(path));
            }
        }
        let header = encode_header(header)?;

        let body = match self {
            Message::InvokeRequest(m) => encode_body(vec![
                json!(m.request_message_id),
                m.data.clone(),
                files_to_value(&m.files),
            ])?,
            Message::InvokeResponse(m) => encode_body(vec![
                json!(m.request_message_id),
                json!(m.response_message_id),
                m.data.clone(),
                files_to_value(&m.files),
            ])?,
            Message::InvokeFinish(m) => encode_body(vec![json!(m.response_message_id)])?,
            Message::InvokeFailed(m) => encode_body(vec![
                json!(m.request_message_id),
                json!(m.error),
                json!(m.stack),
            ])?,
            Message::InvokeFileRequest(m) => {
                encode_body(vec![json!(m.message_id), json!(m.id), json!(m.index)])?
            }
            Message::InvokeFileResponse(m) => encode_file_body(
                vec![json!(m.message_id), json!(m.id), json!(m.index)],
                &m.data,
            )?,
            Message::InvokeFileFailed(m) => {
                encode_body(vec![json!(m.message_id), json!(m.id), json!(m.error)])?
            }
            Message::InvokeFileFinish(m) => encode_body(vec![json!(m.message_id), json!(m.id)])?,
            Message::Broadcast(m) => encode_body(vec![m.data.clone()])?,
            Message::BroadcastOpen(m) => encode_body(vec![
                json!(m.message_id),
                json!(m.broadcast_sender),
                json!(m.path),
            ])?,
            Message::BroadcastOpenFinish(m) => encode_body(vec![json!(m.message_id)])?,
            Message::BroadcastClose(m) => encode_body(vec![
                json!(m.message_id),
                json!(m.broadcast_sender),
                json!(m.path),
                json!(m.include_ancestor),
            ])?,
            Message::BroadcastCloseFinish(m) => encode_body(vec![json!(m.message_id)])?,
        };

        Ok((header, body))
    }

    /// Decode `(header, body)` received by module `local_name`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteInvokeError::Protocol`] when the header or body is
    /// malformed, the receiver is not `local_name`, a path exceeds
    /// `max_path_length` code points, or a numeric field is not a safe
    /// non-negative integer.
    pub fn parse(
        local_name: &str,
        header: &str,
        body: &Bytes,
        max_path_length: usize,
    ) -> Result<Message> {
        let header = FieldReader::from_slice(header.as_bytes(), "header")?;
        let ordinal = header.integer(0, "type")?;
        let ty = MessageType::from_wire(ordinal).ok_or_else(|| {
            RemoteInvokeError::protocol(format!("unknown message type {}", ordinal))
        })?;
        let sender = header.string(1, "sender")?;

        let receiver = if ty.has_receiver() {
            let receiver = header.string(2, "receiver")?;
            if receiver != local_name {
                return Err(RemoteInvokeError::protocol(format!(
                    "{} addressed to `{}` received by `{}`",
                    ty, receiver, local_name
                )));
            }
            receiver
        } else {
            String::new()
        };

        if ty == MessageType::InvokeFileResponse {
            let (preamble, data) = decode_file_body(body)?;
            return Ok(Message::InvokeFileResponse(InvokeFileResponseMessage {
                sender,
                receiver,
                message_id: preamble.integer(0, "messageID")?,
                id: preamble.integer(1, "id")?,
                index: preamble.integer(2, "index")?,
                data,
            }));
        }

        let mut b = FieldReader::from_slice(body, "body")?;

        let message = match ty {
            MessageType::InvokeRequest => {
                let path = header.string(3, "path")?;
                check_path(&path, max_path_length)?;
                let files = files_from_value(&b.take(2))?;
                Message::InvokeRequest(InvokeRequestMessage {
                    sender,
                    receiver,
                    path,
                    request_message_id: b.integer(0, "requestMessageID")?,
                    data: b.take(1),
                    files,
                })
            }
            MessageType::InvokeResponse => {
                let files = files_from_value(&b.take(3))?;
                Message::InvokeResponse(InvokeResponseMessage {
                    sender,
                    receiver,
                    request_message_id: b.integer(0, "requestMessageID")?,
                    response_message_id: b.integer(1, "responseMessageID")?,
                    data: b.take(2),
                    files,
                })
            }
            MessageType::InvokeFinish => Message::InvokeFinish(InvokeFinishMessage {
                sender,
                receiver,
                response_message_id: b.integer(0, "responseMessageID")?,
            }),
            MessageType::InvokeFailed => Message::InvokeFailed(InvokeFailedMessage {
                sender,
                receiver,
                request_message_id: b.integer(0, "requestMessageID")?,
                error: b.string(1, "error")?,
                stack: b.opt_string(2, "stack")?,
            }),
            MessageType::InvokeFileRequest => {
                Message::InvokeFileRequest(InvokeFileRequestMessage {
                    sender,
                    receiver,
                    message_id: b.integer(0, "messageID")?,
                    id: b.integer(1, "id")?,
                    index: b.integer(2, "index")?,
                })
            }
            MessageType::InvokeFileFailed => Message::InvokeFileFailed(InvokeFileFailedMessage {
                sender,
                receiver,
                message_id: b.integer(0, "messageID")?,
                id: b.integer(1, "id")?,
                error: b.string(2, "error")?,
            }),
            MessageType::InvokeFileFinish => Message::InvokeFileFinish(InvokeFileFinishMessage {
                sender,
                receiver,
                message_id: b.integer(0, "messageID")?,
                id: b.integer(1, "id")?,
            }),
            MessageType::Broadcast => {
                let path = header.string(3, "path")?;
                check_path(&path, max_path_length)?;
                Message::Broadcast(BroadcastMessage {
                    sender,
                    path,
                    data: b.take(0),
                })
            }
            MessageType::BroadcastOpen => {
                let path = b.string(2, "path")?;
                check_path(&path, max_path_length)?;
                Message::BroadcastOpen(BroadcastOpenMessage {
                    sender,
                    receiver,
                    message_id: b.integer(0, "messageID")?,
                    broadcast_sender: b.string(1, "broadcastSender")?,
                    path,
                })
            }
            MessageType::BroadcastOpenFinish => {
                Message::BroadcastOpenFinish(BroadcastOpenFinishMessage {
                    sender,
                    receiver,
                    message_id: b.integer(0, "messageID")?,
                })
            }
            MessageType::BroadcastClose => {
                let path = b.string(2, "path")?;
                check_path(&path, max_path_length)?;
                Message::BroadcastClose(BroadcastCloseMessage {
                    sender,
                    receiver,
                    message_id: b.integer(0, "messageID")?,
                    broadcast_sender: b.string(1, "broadcastSender")?,
                    path,
                    include_ancestor: b.boolean(3, "includeAncestor")?,
                })
            }
            MessageType::BroadcastCloseFinish => {
                Message::BroadcastCloseFinish(BroadcastCloseFinishMessage {
                    sender,
                    receiver,
                    message_id: b.integer(0, "messageID")?,
                })
            }
            MessageType::InvokeFileResponse
            | MessageType::OnOpen
            | MessageType::OnClose
            | MessageType::BroadcastWhiteList => {
                return Err(RemoteInvokeError::protocol(format!(
                    "unexpected message type {}",
                    ty
                )))
            }
        };

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.message_type(), self.sender())?;
        if let Some(receiver) = self.receiver() {
            write!(f, " -> {}", receiver)?;
        }
        if let Some(path) = self.path() {
            write!(f, " [{}]", path)?;
        }
        Ok(())
    }
}
