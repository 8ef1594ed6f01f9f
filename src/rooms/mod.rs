//! Rooms: per-room expiry policy, the persisted cursor, and the scheduler.
//!
//! A `Room` is the single in-memory instance for one room id. It is shared
//! between that room's scheduler task and the command front end; both touch
//! its state only through short critical sections that never span an await.
//!
//! Lifecycle:
//! - UNCONFIGURED: no delay set
//! - ARMED: delay set, deletion off
//! - PENDING_CONFIRM: `enable` asked, waiting for `confirm`
//! - RUNNING: deletion on, task live
//! - STOPPED: disabled by an admin or the task failed; `enable` again to resume

pub mod expiry;
pub mod scheduler;

use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex as TaskMutex, MutexGuard as TaskGuard, Notify};

use crate::error::{DestroyerError, Result};
use crate::store::{RoomRow, RoomStore};
use crate::transport::RoomEvent;

pub use scheduler::{RoomScheduler, SchedulerSettings};

/// Expiry policy for a room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPolicy {
    /// Delay after which messages are redacted; `None` until configured.
    pub delete_after_ms: Option<i64>,
    pub deletion_enabled: bool,
    /// Set by `enable`, cleared by `confirm`. Never persisted.
    pub accept_requested: bool,
}

/// Pointer to the next event due for redaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub event_id: String,
    pub timestamp: i64,
    pub batch_token_start: Option<String>,
    pub batch_token_end: Option<String>,
}

impl Cursor {
    pub fn from_event(event: &RoomEvent, start: Option<String>, end: Option<String>) -> Self {
        Self {
            event_id: event.event_id.clone(),
            timestamp: event.timestamp,
            batch_token_start: start,
            batch_token_end: end,
        }
    }

    fn from_row(row: &RoomRow) -> Option<Self> {
        Some(Self {
            event_id: row.event_id.clone()?,
            timestamp: row.timestamp?,
            batch_token_start: row.batch_token_start.clone(),
            batch_token_end: row.batch_token_end.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Unconfigured,
    Armed,
    PendingConfirm,
    Running,
    Stopped,
}

#[derive(Debug)]
struct RoomState {
    policy: RoomPolicy,
    cursor: Option<Cursor>,
    stopped: bool,
}

pub struct Room {
    room_id: String,
    store: RoomStore,
    state: Mutex<RoomState>,
    policy_changed: Notify,
    /// Held by the room's scheduler for as long as it runs.
    task_slot: TaskMutex<()>,
}

impl Room {
    fn from_row(store: RoomStore, row: RoomRow) -> Self {
        let cursor = Cursor::from_row(&row);
        Self {
            room_id: row.room_id,
            store,
            state: Mutex::new(RoomState {
                policy: RoomPolicy {
                    delete_after_ms: row.delete_after_ms,
                    deletion_enabled: row.deletion_turned_on,
                    accept_requested: false,
                },
                cursor,
                stopped: false,
            }),
            policy_changed: Notify::new(),
            task_slot: TaskMutex::new(()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn policy(&self) -> RoomPolicy {
        self.state().policy.clone()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.state().cursor.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.state().policy.deletion_enabled
    }

    pub fn phase(&self) -> RoomPhase {
        let state = self.state();
        if state.policy.delete_after_ms.is_none() {
            RoomPhase::Unconfigured
        } else if state.policy.deletion_enabled {
            RoomPhase::Running
        } else if state.policy.accept_requested {
            RoomPhase::PendingConfirm
        } else if state.stopped {
            RoomPhase::Stopped
        } else {
            RoomPhase::Armed
        }
    }

    /// Resolves the next time the delay or the enabled flag changes.
    pub fn policy_changed(&self) -> Notified<'_> {
        self.policy_changed.notified()
    }

    /// Wait until no other scheduler is driving this room.
    pub async fn claim_task(&self) -> TaskGuard<'_, ()> {
        self.task_slot.lock().await
    }

    /// Minutes until an event stamped `timestamp` expires under this room's delay.
    pub fn compute_minutes_to_expiry(&self, timestamp: i64) -> Result<f64> {
        self.compute_minutes_to_expiry_at(timestamp, Utc::now().timestamp_millis())
    }

    pub fn compute_minutes_to_expiry_at(&self, timestamp: i64, now_ms: i64) -> Result<f64> {
        let delete_after = self
            .state()
            .policy
            .delete_after_ms
            .ok_or_else(|| DestroyerError::DelayNotSet {
                room_id: self.room_id.clone(),
            })?;
        Ok(expiry::minutes_to_expiry(delete_after, timestamp, now_ms))
    }

    /// Persist and install a new cursor. Moving to an older event is refused.
    pub fn set_cursor(&self, cursor: Option<Cursor>) -> Result<()> {
        let mut state = self.state();
        if let (Some(current), Some(next)) = (&state.cursor, &cursor) {
            if next.timestamp < current.timestamp {
                return Err(DestroyerError::consistency(
                    &self.room_id,
                    format!(
                        "cursor would move back from {} ({}) to {} ({})",
                        current.event_id, current.timestamp, next.event_id, next.timestamp
                    ),
                ));
            }
        }
        match &cursor {
            Some(c) => self.store.set_room_event(
                &self.room_id,
                Some(&c.event_id),
                Some(c.timestamp),
                c.batch_token_start.as_deref(),
                c.batch_token_end.as_deref(),
            )?,
            None => self
                .store
                .set_room_event(&self.room_id, None, None, None, None)?,
        }
        state.cursor = cursor;
        Ok(())
    }

    pub fn set_delete_after(&self, delete_after_ms: i64) -> Result<()> {
        {
            let mut state = self.state();
            self.store
                .set_delete_after(&self.room_id, Some(delete_after_ms))?;
            state.policy.delete_after_ms = Some(delete_after_ms);
        }
        self.policy_changed.notify_waiters();
        Ok(())
    }

    /// Mark an enable request as awaiting confirmation.
    pub fn request_accept(&self) {
        self.state().policy.accept_requested = true;
    }

    /// Turn deletion on. Returns false if no enable request was pending.
    pub fn confirm_accept(&self) -> Result<bool> {
        let mut state = self.state();
        if !state.policy.accept_requested {
            return Ok(false);
        }
        self.store.set_deletion_turned_on(&self.room_id, true)?;
        state.policy.deletion_enabled = true;
        state.policy.accept_requested = false;
        state.stopped = false;
        Ok(true)
    }

    /// Turn deletion off. Returns false if it was already off in this
    /// process; the stored flag is cleared either way.
    pub fn disable(&self) -> Result<bool> {
        let changed = {
            let mut state = self.state();
            self.store.set_deletion_turned_on(&self.room_id, false)?;
            let was_on = state.policy.deletion_enabled;
            state.policy.deletion_enabled = false;
            state.policy.accept_requested = false;
            state.stopped = true;
            was_on
        };
        if changed {
            self.policy_changed.notify_waiters();
        }
        Ok(changed)
    }

    /// The room's task died. Deletion stays on in storage so a restart
    /// retries, but in this process the room needs a fresh `enable`.
    pub fn mark_failed(&self) {
        let mut state = self.state();
        state.policy.deletion_enabled = false;
        state.stopped = true;
    }
}

/// One `Room` per room id for the life of the process.
pub struct RoomCache {
    store: RoomStore,
    rooms: DashMap<String, Arc<Room>>,
}

impl RoomCache {
    pub fn new(store: RoomStore) -> Self {
        Self {
            store,
            rooms: DashMap::new(),
        }
    }

    pub fn store(&self) -> &RoomStore {
        &self.store
    }

    /// The cached room, loading it from storage on first use.
    /// `None` if the room has never been initialized.
    pub fn get_existing(&self, room_id: &str) -> Result<Option<Arc<Room>>> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(Some(room.clone()));
        }
        let Some(row) = self.store.get_room(room_id)? else {
            return Ok(None);
        };
        let room = Arc::new(Room::from_row(self.store.clone(), row));
        Ok(Some(self.insert(room)))
    }

    /// Like `get_existing`, creating the row when missing.
    /// The flag is true when the row was created by this call.
    pub fn get_or_create(&self, room_id: &str) -> Result<(Arc<Room>, bool)> {
        if let Some(room) = self.get_existing(room_id)? {
            return Ok((room, false));
        }
        self.store.create_room(room_id)?;
        let room = self
            .get_existing(room_id)?
            .ok_or_else(|| DestroyerError::consistency(room_id, "room row missing after insert"))?;
        tracing::info!(room_id, "initialized room");
        Ok((room, true))
    }

    fn insert(&self, room: Arc<Room>) -> Arc<Room> {
        match self.rooms.entry(room.room_id.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(room).clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
