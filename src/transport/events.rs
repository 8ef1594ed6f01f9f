//! Room event model: the fields the scheduler reads from history.
//!
//! State and structural events are exempt: room configuration, membership,
//! creation, earlier redactions, and anything without a declared type.
//! They are never redacted, no matter how old.

use serde::{Deserialize, Serialize};

/// Event types that must survive expiry. `default` stands for events whose
/// type could not be read.
pub const EXEMPT_EVENT_TYPES: &[&str] = &[
    "m.room.server_acl",
    "m.room.encryption",
    "m.room.name",
    "m.room.avatar",
    "m.room.topic",
    "m.room.guest_access",
    "m.room.history_visibility",
    "m.room.join_rules",
    "m.room.power_levels",
    "m.room.create",
    "m.room.member",
    "m.room.redaction",
    "default",
];

pub const REDACTION_EVENT_TYPE: &str = "m.room.redaction";

/// Metadata left on an event once something redacted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redaction {
    /// Type of the redacting event, normally `m.room.redaction`.
    pub event_type: String,
    /// Account that issued the redaction.
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: String,
    /// Server timestamp, milliseconds since the epoch.
    pub timestamp: i64,
    /// Declared event type; `default` when the server sent none.
    pub event_type: String,
    pub sender: String,
    pub redacted_because: Option<Redaction>,
}

impl RoomEvent {
    /// A plain chat message.
    pub fn message(event_id: impl Into<String>, sender: impl Into<String>, timestamp: i64) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp,
            event_type: "m.room.message".to_string(),
            sender: sender.into(),
            redacted_because: None,
        }
    }

    /// An event of an arbitrary type.
    pub fn with_type(
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        sender: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp,
            event_type: event_type.into(),
            sender: sender.into(),
            redacted_because: None,
        }
    }

    pub fn is_exempt(&self) -> bool {
        EXEMPT_EVENT_TYPES.contains(&self.event_type.as_str())
    }

    pub fn is_redacted(&self) -> bool {
        self.redacted_because
            .as_ref()
            .is_some_and(|r| r.event_type == REDACTION_EVENT_TYPE)
    }

    /// Redacted, and the redaction was issued by `user_id`.
    pub fn is_redacted_by(&self, user_id: &str) -> bool {
        self.redacted_because
            .as_ref()
            .is_some_and(|r| r.event_type == REDACTION_EVENT_TYPE && r.sender == user_id)
    }
}
