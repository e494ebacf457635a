//! Core types for the store client.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Names of the notifications delivered through the hub.
pub mod events {
    /// A remote insert/replace reached the stream.
    pub const PUT: &str = "put";
    /// A remote merge reached the stream.
    pub const PATCH: &str = "patch";
    /// A formatted, source-filtered remote change.
    pub const UPDATE: &str = "update";
    /// The push channel reported open.
    pub const CONNECT: &str = "connect";
    /// The push channel was torn down; payload carries the reason.
    pub const CLOSE: &str = "close";
    /// A steady-state stream failure (the connection stays up).
    pub const ERROR: &str = "error";
}

/// Milliseconds since Unix epoch, by the local clock.
pub fn now_millis() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");
    duration.as_millis() as i64
}

/// A typed record reconstituted from a composite key and a raw store node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Application-defined type (the part of the key before `!`).
    #[serde(rename = "type")]
    pub record_type: String,

    /// Sortable identifier (the part of the key after the first `!`).
    pub id: String,

    /// Server-assigned write time in milliseconds, when the node carried
    /// the `{timestamp, value}` write wrapper.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,

    /// Application payload.
    pub value: Value,
}

impl Record {
    /// Merge `type`/`id`/`timestamp` back into the value object, producing
    /// the flat shape the wire uses.
    pub fn to_value(&self) -> Value {
        let mut map = match &self.value {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => {
                let mut m = Map::new();
                m.insert("value".to_string(), other.clone());
                m
            }
        };
        map.insert("type".to_string(), Value::String(self.record_type.clone()));
        map.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(ts) = self.timestamp {
            map.insert("timestamp".to_string(), Value::Number(ts.into()));
        }
        Value::Object(map)
    }
}

/// Kind of a remote change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Put,
    Patch,
}

impl EventKind {
    /// Wire name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Put => events::PUT,
            EventKind::Patch => events::PATCH,
        }
    }

    /// Parse a wire event name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            events::PUT => Some(EventKind::Put),
            events::PATCH => Some(EventKind::Patch),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded remote change notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Whether the remote applied a replace (`put`) or a merge (`patch`).
    pub kind: EventKind,

    /// Store path the change applies to. `/` denotes the initial
    /// synchronization snapshot delivered right after connect.
    pub path: String,

    /// Raw change payload.
    pub data: Value,
}

impl StreamEvent {
    /// True for the initial synchronization snapshot (`path == "/"`),
    /// which must not be mistaken for a per-record update.
    pub fn is_snapshot(&self) -> bool {
        self.path == "/"
    }
}

/// Why a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Caller-initiated close.
    Closed,
    /// Forced close of a previous channel on reconnect.
    Reconnect,
    /// Remote cancelled the stream.
    Cancel,
    /// Remote revoked authorization.
    AuthRevoked,
    /// Low-level close with no remote signal.
    Reset,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Closed => "closed",
            CloseReason::Reconnect => "reconnect",
            CloseReason::Cancel => "cancel",
            CloseReason::AuthRevoked => "auth_revoked",
            CloseReason::Reset => "reset",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of the push connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed(CloseReason),
}

/// Payload delivered to notification handlers.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// A raw remote change (`put`/`patch` events).
    Stream(StreamEvent),
    /// A formatted record (`update` events).
    Update(Record),
    /// The channel opened (`connect` events).
    Connected,
    /// The channel was torn down (`close` events).
    Closed { reason: CloseReason },
    /// A steady-state stream failure (`error` events).
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_to_value_merges_identity() {
        let record = Record {
            record_type: "chat".to_string(),
            id: "1000ABCDEF1234567890".to_string(),
            timestamp: Some(1234),
            value: json!({"text": "hi"}),
        };

        let merged = record.to_value();
        assert_eq!(merged["text"], "hi");
        assert_eq!(merged["type"], "chat");
        assert_eq!(merged["id"], "1000ABCDEF1234567890");
        assert_eq!(merged["timestamp"], 1234);
    }

    #[test]
    fn test_record_to_value_wraps_scalars() {
        let record = Record {
            record_type: "counter".to_string(),
            id: "X".to_string(),
            timestamp: None,
            value: json!(42),
        };

        let merged = record.to_value();
        assert_eq!(merged["value"], 42);
        assert_eq!(merged["type"], "counter");
        assert!(merged.get("timestamp").is_none());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::Put.as_str(), "put");
        assert_eq!(EventKind::Patch.as_str(), "patch");
        assert_eq!(EventKind::from_name("put"), Some(EventKind::Put));
        assert_eq!(EventKind::from_name("patch"), Some(EventKind::Patch));
        assert_eq!(EventKind::from_name("cancel"), None);
    }

    #[test]
    fn test_snapshot_detection() {
        let snapshot = StreamEvent {
            kind: EventKind::Put,
            path: "/".to_string(),
            data: json!(null),
        };
        let update = StreamEvent {
            kind: EventKind::Put,
            path: "/chat!1000ABCDEF1234567890".to_string(),
            data: json!({"text": "hi"}),
        };

        assert!(snapshot.is_snapshot());
        assert!(!update.is_snapshot());
    }

    #[test]
    fn test_close_reason_strings() {
        assert_eq!(CloseReason::Closed.as_str(), "closed");
        assert_eq!(CloseReason::Reconnect.as_str(), "reconnect");
        assert_eq!(CloseReason::Cancel.as_str(), "cancel");
        assert_eq!(CloseReason::AuthRevoked.as_str(), "auth_revoked");
        assert_eq!(CloseReason::Reset.as_str(), "reset");
    }
}
