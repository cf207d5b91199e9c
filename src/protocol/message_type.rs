//! Message type enumeration.
//!
//! Ordinals are wire-stable: the first element of every header is the
//! ordinal of its [`MessageType`]. The last three variants are
//! process-local markers used only as dispatch keys and are never packed.

use std::fmt;

/// Closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    /// Invoke an exported method.
    InvokeRequest = 0,
    /// Successful invoke result.
    InvokeResponse = 1,
    /// Caller has pulled every file of a response.
    InvokeFinish = 2,
    /// Invoke failed on the callee.
    InvokeFailed = 3,
    /// Pull one chunk of a file.
    InvokeFileRequest = 4,
    /// One chunk of a file.
    InvokeFileResponse = 5,
    /// File could not be served.
    InvokeFileFailed = 6,
    /// File has no more data.
    InvokeFileFinish = 7,
    /// Hierarchical publish.
    Broadcast = 8,
    /// Declare interest in a broadcast path.
    BroadcastOpen = 9,
    /// Acknowledge [`MessageType::BroadcastOpen`].
    BroadcastOpenFinish = 10,
    /// Withdraw interest in a broadcast path.
    BroadcastClose = 11,
    /// Acknowledge [`MessageType::BroadcastClose`].
    BroadcastCloseFinish = 12,
    /// Local marker: logical connection opened.
    OnOpen = 13,
    /// Local marker: logical connection closed.
    OnClose = 14,
    /// Local marker: broadcast whitelist entries.
    BroadcastWhiteList = 15,
}

impl MessageType {
    /// Every type that may appear on the wire, in ordinal order.
    pub const WIRE: [MessageType; 13] = [
        MessageType::InvokeRequest,
        MessageType::InvokeResponse,
        MessageType::InvokeFinish,
        MessageType::InvokeFailed,
        MessageType::InvokeFileRequest,
        MessageType::InvokeFileResponse,
        MessageType::InvokeFileFailed,
        MessageType::InvokeFileFinish,
        MessageType::Broadcast,
        MessageType::BroadcastOpen,
        MessageType::BroadcastOpenFinish,
        MessageType::BroadcastClose,
        MessageType::BroadcastCloseFinish,
    ];

    /// Wire ordinal.
    #[inline]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Look up a wire type by ordinal.
    ///
    /// Returns `None` for unknown ordinals and for the local-only markers.
    pub fn from_wire(ordinal: u64) -> Option<Self> {
        Self::WIRE.get(usize::try_from(ordinal).ok()?).copied()
    }

    /// Check if this type is a process-local marker.
    #[inline]
    pub fn is_local(self) -> bool {
        matches!(
            self,
            MessageType::OnOpen | MessageType::OnClose | MessageType::BroadcastWhiteList
        )
    }

    /// Check if messages of this type carry a receiver.
    #[inline]
    pub fn has_receiver(self) -> bool {
        !matches!(self, MessageType::Broadcast) && !self.is_local()
    }

    /// Protocol name of this type.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::InvokeRequest => "invoke_request",
            MessageType::InvokeResponse => "invoke_response",
            MessageType::InvokeFinish => "invoke_finish",
            MessageType::InvokeFailed => "invoke_failed",
            MessageType::InvokeFileRequest => "invoke_file_request",
            MessageType::InvokeFileResponse => "invoke_file_response",
            MessageType::InvokeFileFailed => "invoke_file_failed",
            MessageType::InvokeFileFinish => "invoke_file_finish",
            MessageType::Broadcast => "broadcast",
            MessageType::BroadcastOpen => "broadcast_open",
            MessageType::BroadcastOpenFinish => "broadcast_open_finish",
            MessageType::BroadcastClose => "broadcast_close",
            MessageType::BroadcastCloseFinish => "broadcast_close_finish",
            MessageType::OnOpen => "_onOpen",
            MessageType::OnClose => "_onClose",
            MessageType::BroadcastWhiteList => "_broadcast_white_list",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_ordinals_are_stable() {
        assert_eq!(MessageType::InvokeRequest.ordinal(), 0);
        assert_eq!(MessageType::InvokeFileResponse.ordinal(), 5);
        assert_eq!(MessageType::Broadcast.ordinal(), 8);
        assert_eq!(MessageType::BroadcastCloseFinish.ordinal(), 12);

        for (i, ty) in MessageType::WIRE.iter().enumerate() {
            assert_eq!(ty.ordinal() as usize, i);
            assert_eq!(MessageType::from_wire(i as u64), Some(*ty));
        }
    }

    #[test]
    fn test_local_markers_not_on_wire() {
        assert!(MessageType::from_wire(13).is_none());
        assert!(MessageType::from_wire(14).is_none());
        assert!(MessageType::from_wire(15).is_none());
        assert!(MessageType::from_wire(u64::MAX).is_none());
        assert!(MessageType::OnClose.is_local());
        assert!(!MessageType::InvokeRequest.is_local());
    }

    #[test]
    fn test_receiver_bearing_types() {
        assert!(MessageType::InvokeRequest.has_receiver());
        assert!(MessageType::BroadcastOpen.has_receiver());
        assert!(!MessageType::Broadcast.has_receiver());
    }

    #[test]
    fn test_display_uses_protocol_name() {
        assert_eq!(MessageType::InvokeFileFinish.to_string(), "invoke_file_finish");
        assert_eq!(MessageType::BroadcastWhiteList.to_string(), "_broadcast_white_list");
    }
}
