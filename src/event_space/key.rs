//! Key paths for the event space.

use std::fmt;

use crate::protocol::{path_segments, MessageType};

/// One segment of a key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySegment {
    /// Message type (or local marker) at the head of a path.
    Type(MessageType),
    /// Module name or path segment.
    Text(String),
    /// Message id, file id or index.
    Id(u64),
}

impl From<MessageType> for KeySegment {
    fn from(ty: MessageType) -> Self {
        KeySegment::Type(ty)
    }
}

impl From<&str> for KeySegment {
    fn from(s: &str) -> Self {
        KeySegment::Text(s.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(s: String) -> Self {
        KeySegment::Text(s)
    }
}

impl From<&String> for KeySegment {
    fn from(s: &String) -> Self {
        KeySegment::Text(s.clone())
    }
}

impl From<u64> for KeySegment {
    fn from(n: u64) -> Self {
        KeySegment::Id(n)
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Type(ty) => write!(f, "{}", ty),
            KeySegment::Text(s) => f.write_str(s),
            KeySegment::Id(n) => write!(f, "{}", n),
        }
    }
}

/// Ordered key path, e.g. `[invoke_response, 42]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct EventKey(Vec<KeySegment>);

impl EventKey {
    /// Start a key with a message type.
    pub fn new(ty: MessageType) -> Self {
        Self(vec![KeySegment::Type(ty)])
    }

    /// Append a segment.
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Append every segment of a dot-separated path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.0.extend(path_segments(path).map(KeySegment::from));
        self
    }

    /// Key segments.
    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the key has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<KeySegment>> for EventKey {
    fn from(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", segment)?;
        }
        f.write_str("]")
    }
}

/// Build an [`EventKey`] from a message type and any number of segments.
///
/// ```
/// use remote_invoke::event_key;
/// use remote_invoke::protocol::MessageType;
///
/// let key = event_key![MessageType::InvokeResponse, 42u64];
/// assert_eq!(key.to_string(), "[invoke_response, 42]");
/// ```
#[macro_export]
macro_rules! event_key {
    ($ty:expr $(, $segment:expr)* $(,)?) => {
        $crate::event_space::EventKey::new($ty)$(.with($segment))*
    };
}
