//! Room scheduler: one room's expiry loop.
//!
//! Two phases:
//! - retroactive cleanup: once a first expired event is found, everything
//!   older that we have not redacted yet is redacted oldest first
//!   (`backfill`).
//! - steady state: sleep until the cursor event expires, redact it, step the
//!   cursor to the next redactable event (`run`).
//!
//! The cursor is persisted only after everything older than it has been
//! redacted, so a task cancelled at any point resumes from the right place.
//! A room runs at most one scheduler at a time; a replacement waits for the
//! previous one to let go of the room.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{DestroyerError, Result};
use crate::rooms::expiry;
use crate::rooms::{Cursor, Room};
use crate::transport::{Direction, RoomEvent, Transport};

/// Timing and paging knobs shared by every room task.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Pause before a freshly started task touches the room.
    pub startup_delay: Duration,
    /// How often a room without a cursor looks for newly expired events.
    pub idle_poll: Duration,
    /// Events requested per history page.
    pub page_limit: u32,
    /// Command prefix quoted in failure notices.
    pub command_prefix: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(2),
            idle_poll: Duration::from_secs(60),
            page_limit: 100,
            command_prefix: "!c".to_string(),
        }
    }
}

/// Where the forward redaction scan of a backfill begins.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Boundary {
    Token(String),
    StartOfHistory,
}

impl Boundary {
    fn as_from(&self) -> Option<&str> {
        match self {
            Boundary::Token(t) => Some(t),
            Boundary::StartOfHistory => None,
        }
    }
}

enum Wake {
    Elapsed,
    PolicyChanged,
    Cancelled,
}

pub struct RoomScheduler {
    room: Arc<Room>,
    transport: Arc<dyn Transport>,
    settings: SchedulerSettings,
    cancel: CancellationToken,
}

impl RoomScheduler {
    pub fn new(
        room: Arc<Room>,
        transport: Arc<dyn Transport>,
        settings: SchedulerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            room,
            transport,
            settings,
            cancel,
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn compute_minutes_to_expiry(&self, timestamp: i64) -> Result<f64> {
        self.room.compute_minutes_to_expiry(timestamp)
    }

    fn is_expired(&self, event: &RoomEvent) -> Result<bool> {
        Ok(expiry::is_expired(
            self.compute_minutes_to_expiry(event.timestamp)?,
        ))
    }

    fn room_id(&self) -> &str {
        self.room.room_id()
    }

    /// Find the newest expired event we have not redacted yet.
    ///
    /// Walks backward from the present. Hitting one of our own redactions
    /// means everything older was already handled, so the scan stops there.
    pub async fn locate_first_expiring(&self) -> Result<Option<Cursor>> {
        let user_id = self.transport.user_id();
        let mut from: Option<String> = None;
        let mut pending: Option<String> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .transport
                .list_messages(
                    self.room_id(),
                    from.as_deref(),
                    Direction::Backward,
                    self.settings.page_limit,
                )
                .await?;

            for event in &page.events {
                if event.is_redacted_by(user_id) {
                    tracing::debug!(
                        room_id = %self.room_id(),
                        event_id = %event.event_id,
                        pending = ?pending,
                        "reached our last redaction, nothing expired"
                    );
                    return Ok(None);
                }
                if event.is_exempt() {
                    continue;
                }
                if self.is_expired(event)? {
                    tracing::debug!(
                        room_id = %self.room_id(),
                        event_id = %event.event_id,
                        "found first expiring event"
                    );
                    // Backward page: `end` is the older side.
                    return Ok(Some(Cursor::from_event(
                        event,
                        page.end.clone(),
                        Some(page.start.clone()),
                    )));
                }
                pending = Some(event.event_id.clone());
            }

            if page.is_last() {
                break;
            }
            from = page.end;
        }

        tracing::debug!(room_id = %self.room_id(), pending = ?pending, "history exhausted, nothing expired");
        Ok(None)
    }

    /// Redact everything older than `cursor` that is not redacted yet.
    /// Returns the number of events redacted, or `None` if cancelled before
    /// the cursor was reached.
    pub async fn backfill(&self, cursor: &Cursor) -> Result<Option<usize>> {
        let Some(boundary) = self.find_redaction_boundary().await? else {
            return Ok(None);
        };
        tracing::debug!(room_id = %self.room_id(), boundary = ?boundary, "backfill boundary");
        self.redact_forward_until_cursor(&boundary, cursor).await
    }

    /// Backward scan for the newest page holding one of our redactions.
    /// `None` when cancelled.
    async fn find_redaction_boundary(&self) -> Result<Option<Boundary>> {
        let user_id = self.transport.user_id();
        let mut from: Option<String> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .transport
                .list_messages(
                    self.room_id(),
                    from.as_deref(),
                    Direction::Backward,
                    self.settings.page_limit,
                )
                .await?;

            if page.events.iter().any(|e| e.is_redacted_by(user_id)) {
                let boundary = match page.end.clone() {
                    Some(token) if !token.is_empty() => Boundary::Token(token),
                    _ => Boundary::StartOfHistory,
                };
                return Ok(Some(boundary));
            }
            if page.is_last() {
                return Ok(Some(Boundary::StartOfHistory));
            }
            from = page.end;
        }
    }

    async fn redact_forward_until_cursor(
        &self,
        boundary: &Boundary,
        cursor: &Cursor,
    ) -> Result<Option<usize>> {
        let mut from = boundary.as_from().map(str::to_string);
        let mut redacted = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .transport
                .list_messages(
                    self.room_id(),
                    from.as_deref(),
                    Direction::Forward,
                    self.settings.page_limit,
                )
                .await?;

            for event in &page.events {
                if event.event_id == cursor.event_id {
                    return Ok(Some(redacted));
                }
                if event.is_redacted() || event.is_exempt() {
                    continue;
                }
                if !self.is_expired(event)? {
                    return Err(DestroyerError::consistency(
                        self.room_id(),
                        format!(
                            "event {} precedes cursor {} but has not expired",
                            event.event_id, cursor.event_id
                        ),
                    ));
                }
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                self.transport.redact(self.room_id(), &event.event_id).await?;
                redacted += 1;
                tracing::debug!(room_id = %self.room_id(), event_id = %event.event_id, "backfill redacted");
            }

            if page.is_last() {
                break;
            }
            from = page.end;
        }

        tracing::warn!(
            room_id = %self.room_id(),
            event_id = %cursor.event_id,
            "cursor event not seen during backfill"
        );
        Ok(Some(redacted))
    }

    /// Step the cursor to the next event that can still be redacted, or
    /// clear it when there is none yet.
    pub async fn advance_cursor(&self) -> Result<()> {
        let Some(current) = self.room.cursor() else {
            return Ok(());
        };
        let is_candidate = |e: &RoomEvent| {
            e.event_id != current.event_id && !e.is_exempt() && !e.is_redacted()
        };

        let context = match self
            .transport
            .get_context(self.room_id(), &current.event_id, self.settings.page_limit)
            .await
        {
            Ok(context) => Some(context),
            // The cursor event is gone from the server's view; page forward
            // from the older side of its bracket instead.
            Err(DestroyerError::Transport {
                status: Some(404), ..
            }) if current.batch_token_start.is_some() => {
                tracing::warn!(
                    room_id = %self.room_id(),
                    event_id = %current.event_id,
                    "cursor event not found, resuming from its bracket"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let mut from = match context {
            Some(context) => {
                if let Some(next) = context.events_after.iter().find(|e| is_candidate(*e)) {
                    let cursor = self.bracket(next).await?;
                    return self.install(&current, cursor);
                }
                context.end
            }
            None => current.batch_token_start.clone(),
        };
        while let Some(token) = from {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let page = self
                .transport
                .list_messages(
                    self.room_id(),
                    Some(&token),
                    Direction::Forward,
                    self.settings.page_limit,
                )
                .await?;
            if let Some(next) = page.events.iter().find(|e| is_candidate(*e)) {
                let cursor = self.bracket(next).await?;
                return self.install(&current, cursor);
            }
            if page.is_last() {
                break;
            }
            from = page.end;
        }

        tracing::debug!(room_id = %self.room_id(), "no later events, clearing cursor");
        self.room.set_cursor(None)
    }

    /// A cursor for `event` bracketed by the positions just before and just
    /// after it.
    async fn bracket(&self, event: &RoomEvent) -> Result<Cursor> {
        let around = self
            .transport
            .get_context(self.room_id(), &event.event_id, 0)
            .await?;
        Ok(Cursor::from_event(event, around.start, around.end))
    }

    /// Persist `next` as the cursor. Server clocks may disagree, so a later
    /// event stamped earlier than the current cursor inherits its timestamp.
    fn install(&self, current: &Cursor, mut next: Cursor) -> Result<()> {
        if next.timestamp < current.timestamp {
            next.timestamp = current.timestamp;
        }
        tracing::debug!(room_id = %self.room_id(), event_id = %next.event_id, "cursor advanced");
        self.room.set_cursor(Some(next))
    }

    async fn sleep_or_wake(&self, duration: Duration) -> Wake {
        tokio::select! {
            _ = self.cancel.cancelled() => Wake::Cancelled,
            _ = self.room.policy_changed() => Wake::PolicyChanged,
            _ = tokio::time::sleep(duration) => Wake::Elapsed,
        }
    }

    /// Drive the room until deletion is disabled, the task is cancelled,
    /// or an error ends it. Errors are reported into the room first.
    pub async fn run(&self) -> Result<()> {
        let _claim = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            claim = self.room.claim_task() => claim,
        };
        tracing::info!(room_id = %self.room_id(), "room task started");
        let result = self.run_loop().await;
        match &result {
            Ok(()) => tracing::info!(room_id = %self.room_id(), "room task finished"),
            Err(e) => {
                tracing::error!(room_id = %self.room_id(), error = %e, "room task failed");
                self.room.mark_failed();
                self.report_failure(e).await;
            }
        }
        result
    }

    async fn run_loop(&self) -> Result<()> {
        if let Wake::Cancelled = self.sleep_or_wake(self.settings.startup_delay).await {
            return Ok(());
        }

        loop {
            if self.cancel.is_cancelled() || !self.room.is_enabled() {
                return Ok(());
            }

            match self.room.cursor() {
                Some(cursor) => {
                    let minutes = self.compute_minutes_to_expiry(cursor.timestamp)?;
                    if !expiry::is_expired(minutes) {
                        tracing::debug!(
                            room_id = %self.room_id(),
                            event_id = %cursor.event_id,
                            minutes,
                            "waiting for cursor to expire"
                        );
                        match self.sleep_or_wake(expiry::sleep_for(minutes)).await {
                            Wake::Cancelled => return Ok(()),
                            Wake::Elapsed | Wake::PolicyChanged => continue,
                        }
                    }

                    self.transport.redact(self.room_id(), &cursor.event_id).await?;
                    tracing::info!(room_id = %self.room_id(), event_id = %cursor.event_id, "redacted expired event");
                    self.advance_cursor().await?;
                }
                None => {
                    if let Wake::Cancelled = self.sleep_or_wake(self.settings.idle_poll).await {
                        return Ok(());
                    }
                    if !self.room.is_enabled() {
                        return Ok(());
                    }
                    if let Some(found) = self.locate_first_expiring().await? {
                        tracing::info!(room_id = %self.room_id(), event_id = %found.event_id, "expired history found");
                        match self.backfill(&found).await? {
                            Some(count) => {
                                tracing::info!(room_id = %self.room_id(), redacted = count, "backfill complete");
                                self.room.set_cursor(Some(found))?;
                            }
                            None => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    async fn report_failure(&self, error: &DestroyerError) {
        let body = format!(
            "Message deletion stopped: {error}. Re-enable with `{} enable`.",
            self.settings.command_prefix
        );
        if let Err(e) = self.transport.send_notice(self.room_id(), &body, None).await {
            tracing::warn!(room_id = %self.room_id(), error = %e, "failed to post failure notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::RoomCache;
    use crate::store::RoomStore;
    use crate::transport::memory::MemoryTransport;
    use chrono::Utc;

    const ROOM: &str = "!room:memory";
    const BOT: &str = "@bot:memory";
    const MINUTE: i64 = expiry::MS_PER_MINUTE;

    struct Fixture {
        transport: Arc<MemoryTransport>,
        room: Arc<Room>,
    }

    impl Fixture {
        fn new(delay_minutes: i64) -> Self {
            let cache = RoomCache::new(RoomStore::open_memory().unwrap());
            let (room, _) = cache.get_or_create(ROOM).unwrap();
            room.set_delete_after(delay_minutes * MINUTE).unwrap();
            Self {
                transport: Arc::new(MemoryTransport::new(BOT)),
                room,
            }
        }

        fn scheduler(&self, page_limit: u32) -> RoomScheduler {
            let settings = SchedulerSettings {
                startup_delay: Duration::ZERO,
                idle_poll: Duration::from_millis(10),
                page_limit,
                ..SchedulerSettings::default()
            };
            RoomScheduler::new(
                self.room.clone(),
                self.transport.clone(),
                settings,
                CancellationToken::new(),
            )
        }

        /// Push a message `age_minutes` old.
        fn message(&self, id: &str, age_minutes: i64) {
            let ts = Utc::now().timestamp_millis() - age_minutes * MINUTE;
            self.transport
                .push_event(ROOM, RoomEvent::message(id, "@alice:memory", ts));
        }

        fn state_event(&self, id: &str, event_type: &str, age_minutes: i64) {
            let ts = Utc::now().timestamp_millis() - age_minutes * MINUTE;
            self.transport
                .push_event(ROOM, RoomEvent::with_type(id, event_type, "@alice:memory", ts));
        }
    }

    #[tokio::test]
    async fn locate_picks_newest_expired_event() {
        let f = Fixture::new(10);
        f.state_event("$create", "m.room.create", 60);
        f.message("$old", 30);
        f.message("$expired", 11);
        f.message("$fresh", 9);

        let cursor = f.scheduler(2).locate_first_expiring().await.unwrap().unwrap();
        assert_eq!(cursor.event_id, "$expired");
        assert!(cursor.batch_token_start.is_some());
    }

    #[tokio::test]
    async fn locate_stops_at_our_redaction() {
        let f = Fixture::new(10);
        f.message("$a", 30);
        f.transport.redact(ROOM, "$a").await.unwrap();
        f.message("$fresh", 1);

        assert!(f.scheduler(10).locate_first_expiring().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn locate_skips_exempt_and_finds_nothing_when_all_fresh() {
        let f = Fixture::new(10);
        f.state_event("$topic", "m.room.topic", 120);
        f.message("$fresh", 2);

        assert!(f.scheduler(1).locate_first_expiring().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backfill_redacts_older_events_but_not_cursor() {
        let f = Fixture::new(10);
        f.state_event("$member", "m.room.member", 50);
        f.message("$a", 40);
        f.message("$b", 30);
        f.message("$c", 20);
        let s = f.scheduler(2);

        let cursor = s.locate_first_expiring().await.unwrap().unwrap();
        assert_eq!(cursor.event_id, "$c");

        assert_eq!(s.backfill(&cursor).await.unwrap(), Some(2));
        assert_eq!(f.transport.redactions(ROOM), vec!["$a", "$b"]);
        assert!(!f.transport.event(ROOM, "$member").unwrap().is_redacted());
        assert!(!f.transport.event(ROOM, "$c").unwrap().is_redacted());
    }

    #[tokio::test]
    async fn backfill_rejects_unexpired_event_before_cursor() {
        let f = Fixture::new(10);
        f.message("$skewed", 1);
        f.message("$cursor", 20);
        let cursor = Cursor {
            event_id: "$cursor".into(),
            timestamp: Utc::now().timestamp_millis() - 20 * MINUTE,
            batch_token_start: None,
            batch_token_end: None,
        };

        let err = f.scheduler(10).backfill(&cursor).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Consistency);
        assert!(f.transport.redactions(ROOM).is_empty());
    }

    #[tokio::test]
    async fn advance_moves_past_exempt_and_redacted_events() {
        let f = Fixture::new(10);
        f.message("$a", 30);
        f.state_event("$name", "m.room.name", 29);
        f.message("$b", 28);
        f.message("$c", 27);
        f.transport.redact(ROOM, "$b").await.unwrap();
        let s = f.scheduler(1);

        f.room
            .set_cursor(Some(Cursor {
                event_id: "$a".into(),
                timestamp: f.transport.event(ROOM, "$a").unwrap().timestamp,
                batch_token_start: None,
                batch_token_end: None,
            }))
            .unwrap();
        s.advance_cursor().await.unwrap();
        let cursor = f.room.cursor().unwrap();
        assert_eq!(cursor.event_id, "$c");
        // Tight bracket around `$c` (index 3).
        assert_eq!(cursor.batch_token_start.as_deref(), Some("p3"));
        assert_eq!(cursor.batch_token_end.as_deref(), Some("p4"));
    }

    #[tokio::test]
    async fn advance_resumes_from_bracket_when_cursor_event_is_gone() {
        let f = Fixture::new(10);
        f.message("$a", 30);
        f.message("$b", 28);
        f.transport.redact(ROOM, "$a").await.unwrap();

        f.room
            .set_cursor(Some(Cursor {
                event_id: "$purged".into(),
                timestamp: f.transport.event(ROOM, "$a").unwrap().timestamp,
                batch_token_start: Some("p1".into()),
                batch_token_end: Some("p1".into()),
            }))
            .unwrap();
        f.scheduler(10).advance_cursor().await.unwrap();
        assert_eq!(f.room.cursor().unwrap().event_id, "$b");
    }

    #[tokio::test]
    async fn cancelled_backfill_reports_no_completion() {
        let f = Fixture::new(10);
        f.message("$a", 40);
        f.message("$b", 20);
        let s = f.scheduler(10);
        let cursor = s.locate_first_expiring().await.unwrap().unwrap();

        s.cancel.cancel();
        assert_eq!(s.backfill(&cursor).await.unwrap(), None);
        assert!(f.transport.redactions(ROOM).is_empty());
    }

    #[tokio::test]
    async fn advance_clears_cursor_at_end_of_history() {
        let f = Fixture::new(10);
        f.message("$only", 30);
        f.room
            .set_cursor(Some(Cursor {
                event_id: "$only".into(),
                timestamp: f.transport.event(ROOM, "$only").unwrap().timestamp,
                batch_token_start: None,
                batch_token_end: None,
            }))
            .unwrap();
        f.transport.redact(ROOM, "$only").await.unwrap();

        f.scheduler(10).advance_cursor().await.unwrap();
        assert!(f.room.cursor().is_none());
    }

    #[tokio::test]
    async fn run_without_enable_returns_immediately() {
        let f = Fixture::new(10);
        f.message("$a", 30);
        f.scheduler(10).run().await.unwrap();
        assert!(f.transport.redactions(ROOM).is_empty());
    }

    #[tokio::test]
    async fn run_failure_posts_notice_and_stops_room() {
        let f = Fixture::new(10);
        f.message("$a", 30);
        f.room.request_accept();
        f.room.confirm_accept().unwrap();
        f.transport.fail_listings(true);

        let err = f.scheduler(10).run().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
        assert!(!f.room.is_enabled());
        let notices = f.transport.notices(ROOM);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].body.starts_with("Message deletion stopped"));
    }
}
