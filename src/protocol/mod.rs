//! Protocol module - message taxonomy and wire encoding.
//!
//! This module implements the message model:
//! - [`MessageType`] with wire-stable ordinals
//! - [`Message`] tagged records with `pack`/`parse`
//! - JSON header/body helpers and the binary file-response body

mod message;
mod message_type;
mod wire_format;

pub use message::{
    BroadcastCloseFinishMessage, BroadcastCloseMessage, BroadcastMessage,
    BroadcastOpenFinishMessage, BroadcastOpenMessage, FileDescriptor, InvokeFailedMessage,
    InvokeFileFailedMessage, InvokeFileFinishMessage, InvokeFileRequestMessage,
    InvokeFileResponseMessage, InvokeFinishMessage, InvokeRequestMessage, InvokeResponseMessage,
    Message,
};
pub use message_type::MessageType;
pub use wire_format::{
    check_path, decode_file_body, encode_file_body, path_segments, safe_integer, split_number,
    FieldReader, DEFAULT_FILE_PIECE_SIZE, DEFAULT_MAX_PATH_LENGTH, MAX_SAFE_INTEGER,
    PATH_SEPARATOR, PREAMBLE_LENGTH_SIZE,
};
