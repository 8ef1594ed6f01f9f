//! Transport: the scheduler's only way to talk to the homeserver.
//!
//! The core consumes three history operations (list a page, fetch context
//! around an event, redact an event) plus a notice sender for status
//! messages. `matrix` speaks the client-server HTTP API; `memory` keeps a
//! timeline in process and is what the test suites drive.

pub mod events;
pub mod matrix;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use events::{Redaction, RoomEvent, EXEMPT_EVENT_TYPES};

/// Pagination direction through room history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards older events.
    Backward,
    /// Towards newer events.
    Forward,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Backward => "b",
            Direction::Forward => "f",
        }
    }
}

/// One page of room history.
///
/// Events are ordered in the direction of travel: newest first when paging
/// backward, oldest first when paging forward.
#[derive(Debug, Clone, Default)]
pub struct MessagesPage {
    pub events: Vec<RoomEvent>,
    /// Token of the position this page was read from.
    pub start: String,
    /// Token to continue from, absent once history is exhausted.
    pub end: Option<String>,
}

impl MessagesPage {
    /// True when no further page can be requested in this direction.
    pub fn is_last(&self) -> bool {
        match &self.end {
            None => true,
            Some(end) => end.is_empty() || *end == self.start,
        }
    }
}

/// Events following a given event, with the tokens bracketing them.
#[derive(Debug, Clone, Default)]
pub struct ContextPage {
    /// Events after the anchor, oldest first.
    pub events_after: Vec<RoomEvent>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Account this transport acts as. Redactions made by it count as ours.
    fn user_id(&self) -> &str;

    /// Read one page of history. `from = None` starts at the newest event.
    async fn list_messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        direction: Direction,
        limit: u32,
    ) -> Result<MessagesPage>;

    /// Look up the events that follow `event_id`.
    async fn get_context(&self, room_id: &str, event_id: &str, limit: u32) -> Result<ContextPage>;

    async fn redact(&self, room_id: &str, event_id: &str) -> Result<()>;

    /// Post a notice into the room, optionally as a reply. Returns the new event id.
    async fn send_notice(&self, room_id: &str, body: &str, reply_to: Option<&str>)
        -> Result<String>;
}
