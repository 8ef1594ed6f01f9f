//! Sync listener: feeds admin commands and invites to the bot.
//!
//! Long-polls `/sync`, joins rooms it is invited to, and hands messages
//! carrying the command prefix to the `CommandHandler` once the sender is
//! found to be a room admin. The registry is bootstrapped after the first
//! successful sync so resumed rooms start against a live connection.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::bot::backoff::ReconnectBackoff;
use crate::bot::commands::CommandHandler;
use crate::registry::Destroyer;
use crate::transport::matrix::{IncomingMessage, MatrixClient};
use crate::transport::Transport;

/// Event ids remembered for duplicate suppression.
const SEEN_EVENTS_CAPACITY: usize = 1000;

/// Attempts at joining a room we were invited to.
const JOIN_ATTEMPTS: u32 = 3;

/// Prefix clients put in front of an edited message body.
const EDIT_PREFIX: &str = " * ";

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub command_prefix: String,
    pub admin_power_level: i64,
    /// Commands older than this are ignored (replayed history).
    pub command_max_age: Duration,
    pub sync_timeout_ms: u64,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

/// Bounded set of recently handled event ids, oldest evicted first.
#[derive(Debug, Default)]
pub struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// True if the id was not seen before.
    pub fn insert(&mut self, event_id: &str) -> bool {
        if self.ids.contains(event_id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(event_id.to_string());
        self.ids.insert(event_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The command text of a message body, or `None` if it is not a command.
/// Edits are matched on their new text.
pub fn extract_command<'a>(body: &'a str, prefix: &str) -> Option<&'a str> {
    let body = body.strip_prefix(EDIT_PREFIX).unwrap_or(body);
    body.strip_prefix(prefix).map(str::trim)
}

pub fn is_stale(timestamp_ms: i64, now_ms: i64, max_age: Duration) -> bool {
    now_ms.saturating_sub(timestamp_ms) > max_age.as_millis() as i64
}

/// Resume every enabled room. False if it has to be tried again on the
/// next sync.
pub fn bootstrap_rooms(destroyer: &Arc<Destroyer>) -> bool {
    match destroyer.bootstrap() {
        Ok(started) => {
            tracing::info!(started, "initial sync complete");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to resume enabled rooms, retrying after next sync");
            false
        }
    }
}

pub struct Listener {
    client: Arc<MatrixClient>,
    destroyer: Arc<Destroyer>,
    handler: CommandHandler,
    settings: ListenerSettings,
    seen: SeenEvents,
}

impl Listener {
    pub fn new(client: Arc<MatrixClient>, destroyer: Arc<Destroyer>, settings: ListenerSettings) -> Self {
        let handler = CommandHandler::new(destroyer.clone(), settings.command_prefix.clone());
        Self {
            client,
            destroyer,
            handler,
            settings,
            seen: SeenEvents::new(SEEN_EVENTS_CAPACITY),
        }
    }

    /// Sync until `shutdown` fires. Sync failures back off and retry.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut backoff =
            ReconnectBackoff::new(self.settings.reconnect_initial, self.settings.reconnect_max);
        let mut since: Option<String> = None;
        let mut bootstrapped = false;

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.client.sync(since.as_deref(), self.settings.sync_timeout_ms) => r,
            };

            let batch = match result {
                Ok(batch) => batch,
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.is_extended() {
                        tracing::error!(error = %e, failures = backoff.failures(), "homeserver unreachable");
                    } else {
                        tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "sync failed, retrying");
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            backoff.reset();

            if !bootstrapped {
                bootstrapped = bootstrap_rooms(&self.destroyer);
            }

            for room_id in &batch.invites {
                self.join(room_id).await;
            }
            for message in &batch.messages {
                self.handle_message(message).await;
            }
            since = Some(batch.next_batch);
        }
        tracing::info!("listener stopped");
    }

    async fn join(&self, room_id: &str) {
        for attempt in 1..=JOIN_ATTEMPTS {
            match self.client.join(room_id).await {
                Ok(()) => {
                    tracing::info!(room_id, "joined room");
                    return;
                }
                Err(e) => tracing::warn!(room_id, attempt, error = %e, "failed to join room"),
            }
        }
        tracing::error!(room_id, "giving up on invite");
    }

    async fn handle_message(&mut self, message: &IncomingMessage) {
        if message.sender == self.client.user_id() {
            return;
        }
        let now = Utc::now().timestamp_millis();
        if is_stale(message.timestamp, now, self.settings.command_max_age) {
            return;
        }
        if !self.seen.insert(&message.event_id) {
            tracing::debug!(event_id = %message.event_id, "duplicate event, skipping");
            return;
        }
        let Some(command) = extract_command(&message.body, &self.settings.command_prefix) else {
            return;
        };

        match self
            .client
            .user_power_level(&message.room_id, &message.sender)
            .await
        {
            Ok(level) if level >= self.settings.admin_power_level => {}
            Ok(level) => {
                tracing::debug!(room_id = %message.room_id, sender = %message.sender, level, "ignoring command from non-admin");
                return;
            }
            Err(e) => {
                tracing::warn!(room_id = %message.room_id, error = %e, "failed to read power levels");
                return;
            }
        }

        if let Err(e) = self.handler.process(&message.room_id, command).await {
            tracing::warn!(room_id = %message.room_id, error = %e, "command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_strips_prefix_and_edit_marker() {
        assert_eq!(extract_command("!c delay 10", "!c"), Some("delay 10"));
        assert_eq!(extract_command(" * !c enable", "!c"), Some("enable"));
        assert_eq!(extract_command("hello !c", "!c"), None);
    }

    #[test]
    fn stale_after_max_age() {
        let max = Duration::from_secs(300);
        let now = 1_700_000_000_000;
        assert!(!is_stale(now - 299_000, now, max));
        assert!(is_stale(now - 301_000, now, max));
    }

    #[test]
    fn failed_bootstrap_is_retried() {
        use crate::rooms::SchedulerSettings;
        use crate::store::RoomStore;
        use crate::transport::memory::MemoryTransport;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("destroyer.db");
        let destroyer = Arc::new(Destroyer::new(
            RoomStore::open(&path).unwrap(),
            Arc::new(MemoryTransport::new("@bot:memory")),
            SchedulerSettings::default(),
        ));

        let side = rusqlite::Connection::open(&path).unwrap();
        side.execute_batch("ALTER TABLE last_room_events RENAME TO parked")
            .unwrap();
        assert!(!bootstrap_rooms(&destroyer));

        side.execute_batch("ALTER TABLE parked RENAME TO last_room_events")
            .unwrap();
        assert!(bootstrap_rooms(&destroyer));
    }

    #[test]
    fn seen_events_dedupes_and_evicts() {
        let mut seen = SeenEvents::new(2);
        assert!(seen.insert("$a"));
        assert!(!seen.insert("$a"));
        assert!(seen.insert("$b"));
        assert!(seen.insert("$c"));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert("$a"));
    }
}
