//! Room rows: policy flags and the expiry cursor.
//!
//! The cursor columns (`event_id`, `timestamp`, `batch_token_start`,
//! `batch_token_end`) are always written together so a restart never sees
//! half of an advance.

use rusqlite::{params, OptionalExtension};

use crate::error::{DestroyerError, Result};

use super::RoomStore;

/// Everything persisted for one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomRow {
    pub room_id: String,
    pub event_id: Option<String>,
    pub timestamp: Option<i64>,
    pub delete_after_ms: Option<i64>,
    pub deletion_turned_on: bool,
    pub batch_token_start: Option<String>,
    pub batch_token_end: Option<String>,
}

impl RoomStore {
    /// Insert a fresh row. A row that already exists is left untouched.
    pub fn create_room(&self, room_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO last_room_events (room_id) VALUES (?1)",
            params![room_id],
        )?;
        Ok(())
    }

    pub fn room_exists(&self, room_id: &str) -> Result<bool> {
        let conn = self.conn();
        conn.query_row(
            "SELECT COUNT(*) FROM last_room_events WHERE room_id = ?1",
            params![room_id],
            |row| {
                let count: i64 = row.get(0)?;
                Ok(count > 0)
            },
        )
        .map_err(DestroyerError::from)
    }

    pub fn get_room(&self, room_id: &str) -> Result<Option<RoomRow>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT room_id, event_id, timestamp, delete_after, deletion_turned_on,
                        batch_token_start, batch_token_end
                 FROM last_room_events WHERE room_id = ?1",
                params![room_id],
                |row| {
                    let enabled: i64 = row.get(4)?;
                    Ok(RoomRow {
                        room_id: row.get(0)?,
                        event_id: row.get(1)?,
                        timestamp: row.get(2)?,
                        delete_after_ms: row.get(3)?,
                        deletion_turned_on: enabled != 0,
                        batch_token_start: row.get(5)?,
                        batch_token_end: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_room_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT room_id FROM last_room_events ORDER BY room_id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// Rooms whose deletion flag is set, the ones to resume at startup.
    pub fn list_enabled_room_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT room_id FROM last_room_events WHERE deletion_turned_on = 1 ORDER BY room_id",
        )?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    /// Write the cursor quad. `None` for `event_id` clears the cursor.
    pub fn set_room_event(
        &self,
        room_id: &str,
        event_id: Option<&str>,
        timestamp: Option<i64>,
        batch_token_start: Option<&str>,
        batch_token_end: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE last_room_events
             SET event_id = ?1, timestamp = ?2, batch_token_start = ?3, batch_token_end = ?4
             WHERE room_id = ?5",
            params![event_id, timestamp, batch_token_start, batch_token_end, room_id],
        )?;
        Ok(())
    }

    pub fn set_delete_after(&self, room_id: &str, delete_after_ms: Option<i64>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE last_room_events SET delete_after = ?1 WHERE room_id = ?2",
            params![delete_after_ms, room_id],
        )?;
        Ok(())
    }

    pub fn set_deletion_turned_on(&self, room_id: &str, on: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE last_room_events SET deletion_turned_on = ?1 WHERE room_id = ?2",
            params![on as i64, room_id],
        )?;
        Ok(())
    }
}
