//! Destroyer: supervises one expiry task per enabled room.
//!
//! The registry is the only owner of task lifetimes. Registration goes
//! through the DashMap entry API, so concurrent `start` calls for the same
//! room cannot both spawn. A task that ends on its own removes its entry,
//! matched by task id so it never removes a newer task for the same room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::rooms::{Room, RoomCache, RoomScheduler, SchedulerSettings};
use crate::store::RoomStore;
use crate::transport::Transport;

/// Handle to one running room task.
struct RoomTask {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    started_at: Instant,
}

pub struct Destroyer {
    rooms: RoomCache,
    transport: Arc<dyn Transport>,
    settings: SchedulerSettings,
    tasks: DashMap<String, RoomTask>,
    next_task_id: AtomicU64,
}

impl Destroyer {
    pub fn new(store: RoomStore, transport: Arc<dyn Transport>, settings: SchedulerSettings) -> Self {
        Self {
            rooms: RoomCache::new(store),
            transport,
            settings,
            tasks: DashMap::new(),
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn rooms(&self) -> &RoomCache {
        &self.rooms
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// A scheduler for `room` that is not registered as a task. Used for
    /// one-off scans such as the enable preview.
    pub fn scheduler_for(&self, room: Arc<Room>, cancel: CancellationToken) -> RoomScheduler {
        RoomScheduler::new(room, self.transport.clone(), self.settings.clone(), cancel)
    }

    /// Start a task for every room persisted with deletion turned on.
    /// Returns how many were started.
    pub fn bootstrap(self: &Arc<Self>) -> Result<usize> {
        let room_ids = self.rooms.store().list_enabled_room_ids()?;
        let mut started = 0;
        for room_id in &room_ids {
            if self.start(room_id) {
                started += 1;
            }
        }
        tracing::info!(enabled = room_ids.len(), started, "registry bootstrapped");
        Ok(started)
    }

    /// Spawn the expiry task for a room. False if one is already registered
    /// or the room is unknown.
    pub fn start(self: &Arc<Self>, room_id: &str) -> bool {
        let room = match self.rooms.get_existing(room_id) {
            Ok(Some(room)) => room,
            Ok(None) => {
                tracing::warn!(room_id, "cannot start task for uninitialized room");
                return false;
            }
            Err(e) => {
                tracing::warn!(room_id, error = %e, "failed to load room");
                return false;
            }
        };

        match self.tasks.entry(room_id.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(room_id, "room task already running");
                false
            }
            Entry::Vacant(slot) => {
                let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                let scheduler = self.scheduler_for(room, cancel.clone());
                let registry = Arc::clone(self);
                let owned_id = room_id.to_string();

                let handle = tokio::spawn(async move {
                    // Errors are logged and reported by the scheduler itself.
                    let _ = scheduler.run().await;
                    registry.finish(&owned_id, id);
                });

                slot.insert(RoomTask {
                    id,
                    cancel,
                    handle,
                    started_at: Instant::now(),
                });
                tracing::info!(room_id, task_id = id, "room task registered");
                true
            }
        }
    }

    /// Cancel and deregister a room's task. False if none was registered;
    /// otherwise whether the task was still live when cancelled.
    pub fn stop(&self, room_id: &str) -> bool {
        match self.tasks.remove(room_id) {
            None => {
                tracing::debug!(room_id, "no room task to stop");
                false
            }
            Some((_, task)) => {
                task.cancel.cancel();
                let live = !task.handle.is_finished();
                tracing::info!(
                    room_id,
                    task_id = task.id,
                    uptime_secs = task.started_at.elapsed().as_secs(),
                    "room task stopped"
                );
                live
            }
        }
    }

    /// Called by a task as it exits.
    fn finish(&self, room_id: &str, task_id: u64) {
        if self
            .tasks
            .remove_if(room_id, |_, task| task.id == task_id)
            .is_some()
        {
            tracing::debug!(room_id, task_id, "room task deregistered");
        }
    }

    pub fn is_running(&self, room_id: &str) -> bool {
        self.tasks.contains_key(room_id)
    }

    pub fn active_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        rooms.sort();
        rooms
    }

    /// Cancel every task and wait for them to exit.
    pub async fn shutdown(&self) {
        let room_ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<JoinHandle<()>> = room_ids
            .iter()
            .filter_map(|id| self.tasks.remove(id))
            .map(|(_, task)| {
                task.cancel.cancel();
                task.handle
            })
            .collect();

        let count = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "room task ended abnormally");
            }
        }
        tracing::info!(tasks = count, "registry shut down");
    }
}
