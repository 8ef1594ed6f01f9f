//! In-process timeline implementing `Transport`.
//!
//! Each room is an append-only vector of events, oldest first. Pagination
//! tokens are positions between events (`p0` is before the first event,
//! `pN` after the last). Redacting marks the target and appends an
//! `m.room.redaction` event, the same shape a homeserver produces.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as GateMutex, OwnedMutexGuard};

use crate::error::{DestroyerError, Result};
use crate::transport::events::{Redaction, REDACTION_EVENT_TYPE};
use crate::transport::{ContextPage, Direction, MessagesPage, RoomEvent, Transport};

/// A notice the bot posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub event_id: String,
    pub body: String,
    pub reply_to: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    timelines: HashMap<String, Vec<RoomEvent>>,
    redactions: HashMap<String, Vec<String>>,
    notices: HashMap<String, Vec<Notice>>,
    backward_listings: HashMap<String, usize>,
    failing_redacts: HashSet<String>,
    failing_listings: bool,
    next_id: u64,
}

pub struct MemoryTransport {
    user_id: String,
    state: Mutex<MemoryState>,
    redact_gate: Arc<GateMutex<()>>,
}

impl MemoryTransport {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            state: Mutex::new(MemoryState::default()),
            redact_gate: Arc::new(GateMutex::new(())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event to a room's timeline.
    pub fn push_event(&self, room_id: &str, event: RoomEvent) {
        self.state()
            .timelines
            .entry(room_id.to_string())
            .or_default()
            .push(event);
    }

    /// Snapshot of a room's timeline, oldest first.
    pub fn timeline(&self, room_id: &str) -> Vec<RoomEvent> {
        self.state()
            .timelines
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn event(&self, room_id: &str, event_id: &str) -> Option<RoomEvent> {
        self.timeline(room_id)
            .into_iter()
            .find(|e| e.event_id == event_id)
    }

    /// Event ids redacted through this transport, in call order.
    pub fn redactions(&self, room_id: &str) -> Vec<String> {
        self.state()
            .redactions
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn notices(&self, room_id: &str) -> Vec<Notice> {
        self.state().notices.get(room_id).cloned().unwrap_or_default()
    }

    /// Number of backward `list_messages` calls made for a room.
    pub fn backward_listings(&self, room_id: &str) -> usize {
        self.state()
            .backward_listings
            .get(room_id)
            .copied()
            .unwrap_or(0)
    }

    /// Make every redact of `event_id` fail with a server error.
    pub fn fail_redact(&self, event_id: &str) {
        self.state().failing_redacts.insert(event_id.to_string());
    }

    /// Undo `fail_redact`.
    pub fn heal_redact(&self, event_id: &str) {
        self.state().failing_redacts.remove(event_id);
    }

    /// Block every redact until the returned guard is dropped.
    pub async fn hold_redacts(&self) -> OwnedMutexGuard<()> {
        self.redact_gate.clone().lock_owned().await
    }

    /// Make every `list_messages` call fail.
    pub fn fail_listings(&self, fail: bool) {
        self.state().failing_listings = fail;
    }

    fn next_event_id(state: &mut MemoryState) -> String {
        state.next_id += 1;
        format!("$mem{}:memory", state.next_id)
    }
}

fn token(position: usize) -> String {
    format!("p{position}")
}

fn parse_token(token: &str) -> Result<usize> {
    token
        .strip_prefix('p')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| DestroyerError::transport(Some(400), format!("M_INVALID_PARAM: bad token {token}")))
}

#[async_trait]
impl Transport for MemoryTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn list_messages(
        &self,
        room_id: &str,
        from: Option<&str>,
        direction: Direction,
        limit: u32,
    ) -> Result<MessagesPage> {
        let mut state = self.state();
        if state.failing_listings {
            return Err(DestroyerError::transport(Some(502), "M_UNKNOWN: listing failed"));
        }
        if direction == Direction::Backward {
            *state
                .backward_listings
                .entry(room_id.to_string())
                .or_default() += 1;
        }

        let timeline = state.timelines.get(room_id).cloned().unwrap_or_default();
        let limit = limit.max(1) as usize;

        let page = match direction {
            Direction::Backward => {
                let position = match from {
                    Some(t) => parse_token(t)?.min(timeline.len()),
                    None => timeline.len(),
                };
                let low = position.saturating_sub(limit);
                let events: Vec<RoomEvent> = timeline[low..position].iter().rev().cloned().collect();
                let end = (!events.is_empty()).then(|| token(low));
                MessagesPage {
                    events,
                    start: token(position),
                    end,
                }
            }
            Direction::Forward => {
                let position = match from {
                    Some(t) => parse_token(t)?.min(timeline.len()),
                    None => 0,
                };
                let high = (position + limit).min(timeline.len());
                let events = timeline[position..high].to_vec();
                let end = (!events.is_empty()).then(|| token(high));
                MessagesPage {
                    events,
                    start: token(position),
                    end,
                }
            }
        };
        Ok(page)
    }

    async fn get_context(&self, room_id: &str, event_id: &str, limit: u32) -> Result<ContextPage> {
        let state = self.state();
        let timeline = state.timelines.get(room_id).cloned().unwrap_or_default();
        let index = timeline
            .iter()
            .position(|e| e.event_id == event_id)
            .ok_or_else(|| {
                DestroyerError::transport(Some(404), format!("M_NOT_FOUND: event {event_id}"))
            })?;

        let first_after = index + 1;
        let high = (first_after + limit as usize).min(timeline.len());
        Ok(ContextPage {
            events_after: timeline[first_after..high].to_vec(),
            start: Some(token(index)),
            end: Some(token(high)),
        })
    }

    async fn redact(&self, room_id: &str, event_id: &str) -> Result<()> {
        let _gate = self.redact_gate.lock().await;
        let mut state = self.state();
        if state.failing_redacts.contains(event_id) {
            return Err(DestroyerError::transport(Some(500), "M_UNKNOWN: redact failed"));
        }

        let redaction_id = Self::next_event_id(&mut state);
        let user_id = self.user_id.clone();
        let timeline = state.timelines.entry(room_id.to_string()).or_default();
        let target = timeline
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| {
                DestroyerError::transport(Some(404), format!("M_NOT_FOUND: event {event_id}"))
            })?;
        target.redacted_because = Some(Redaction {
            event_type: REDACTION_EVENT_TYPE.to_string(),
            sender: user_id.clone(),
        });
        timeline.push(RoomEvent::with_type(
            redaction_id,
            REDACTION_EVENT_TYPE,
            user_id,
            Utc::now().timestamp_millis(),
        ));

        state
            .redactions
            .entry(room_id.to_string())
            .or_default()
            .push(event_id.to_string());
        Ok(())
    }

    async fn send_notice(
        &self,
        room_id: &str,
        body: &str,
        reply_to: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        let event_id = Self::next_event_id(&mut state);
        let event = RoomEvent::message(event_id.clone(), self.user_id.clone(), Utc::now().timestamp_millis());
        state
            .timelines
            .entry(room_id.to_string())
            .or_default()
            .push(event);
        state
            .notices
            .entry(room_id.to_string())
            .or_default()
            .push(Notice {
                event_id: event_id.clone(),
                body: body.to_string(),
                reply_to: reply_to.map(str::to_string),
            });
        Ok(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM: &str = "!room:memory";

    fn transport_with(n: usize) -> MemoryTransport {
        let t = MemoryTransport::new("@bot:memory");
        for i in 0..n {
            t.push_event(ROOM, RoomEvent::message(format!("$e{i}"), "@alice:memory", i as i64));
        }
        t
    }

    #[tokio::test]
    async fn backward_pages_walk_to_start() {
        let t = transport_with(5);

        let page = t.list_messages(ROOM, None, Direction::Backward, 2).await.unwrap();
        let ids: Vec<_> = page.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["$e4", "$e3"]);
        assert_eq!(page.start, "p5");
        assert_eq!(page.end.as_deref(), Some("p3"));

        let page = t
            .list_messages(ROOM, Some("p1"), Direction::Backward, 2)
            .await
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.end.as_deref(), Some("p0"));

        let page = t
            .list_messages(ROOM, Some("p0"), Direction::Backward, 2)
            .await
            .unwrap();
        assert!(page.events.is_empty());
        assert!(page.is_last());
        assert_eq!(t.backward_listings(ROOM), 3);
    }

    #[tokio::test]
    async fn forward_pages_from_token() {
        let t = transport_with(3);
        let page = t
            .list_messages(ROOM, Some("p1"), Direction::Forward, 10)
            .await
            .unwrap();
        let ids: Vec<_> = page.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["$e1", "$e2"]);
        assert_eq!(page.end.as_deref(), Some("p3"));

        let page = t
            .list_messages(ROOM, Some("p3"), Direction::Forward, 10)
            .await
            .unwrap();
        assert!(page.is_last());
    }

    #[tokio::test]
    async fn redact_marks_target_and_appends_tombstone() {
        let t = transport_with(2);
        t.redact(ROOM, "$e0").await.unwrap();

        let timeline = t.timeline(ROOM);
        assert_eq!(timeline.len(), 3);
        assert!(timeline[0].is_redacted_by("@bot:memory"));
        assert_eq!(timeline[2].event_type, REDACTION_EVENT_TYPE);
        assert_eq!(t.redactions(ROOM), vec!["$e0".to_string()]);
    }

    #[tokio::test]
    async fn context_returns_following_events() {
        let t = transport_with(4);
        let ctx = t.get_context(ROOM, "$e1", 10).await.unwrap();
        let ids: Vec<_> = ctx.events_after.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["$e2", "$e3"]);
        assert_eq!(ctx.start.as_deref(), Some("p1"));
        assert_eq!(ctx.end.as_deref(), Some("p4"));

        let err = t.get_context(ROOM, "$missing", 10).await.unwrap_err();
        assert!(err.to_string().contains("M_NOT_FOUND"));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_transport_errors() {
        let t = transport_with(1);
        t.fail_redact("$e0");
        assert!(t.redact(ROOM, "$e0").await.is_err());
        assert!(t.redactions(ROOM).is_empty());

        t.fail_listings(true);
        assert!(t
            .list_messages(ROOM, None, Direction::Backward, 5)
            .await
            .is_err());
    }
}
