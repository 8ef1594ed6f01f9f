//! SQLite storage: one row per room holding expiry policy and cursor.
//!
//! All access is synchronous (rusqlite). Rows are partitioned by room id, so
//! room tasks never contend on anything but the connection mutex, which is
//! held only for the duration of a statement.
//!
//! Schema versions are tracked in `migration_version`; migrations run
//! forward from the stored version on open.

mod rooms;

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;

pub use rooms::RoomRow;

/// Latest schema version. Bump together with a new arm in `run_migrations`.
pub const LATEST_MIGRATION_VERSION: i64 = 1;

/// Thread-safe wrapper around a SQLite connection.
#[derive(Clone)]
pub struct RoomStore {
    conn: Arc<Mutex<Connection>>,
}

impl RoomStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Acquire the database connection, recovering from mutex poisoning.
    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migration_version (
                version INTEGER PRIMARY KEY
            );",
        )?;
        let current: Option<i64> = conn
            .query_row("SELECT version FROM migration_version", [], |row| row.get(0))
            .optional()?;
        let current = match current {
            Some(v) => v,
            None => {
                conn.execute("INSERT INTO migration_version (version) VALUES (?1)", params![0])?;
                0
            }
        };
        Self::run_migrations(&conn, current)?;
        Ok(())
    }

    fn run_migrations(conn: &Connection, current: i64) -> Result<()> {
        if current < 1 {
            tracing::info!("migrating database from v0 to v1");
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS last_room_events (
                    room_id TEXT PRIMARY KEY,
                    event_id TEXT,
                    timestamp INTEGER,
                    delete_after INTEGER,
                    deletion_turned_on INTEGER NOT NULL DEFAULT 0,
                    batch_token_start TEXT,
                    batch_token_end TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_last_room_events_enabled
                    ON last_room_events(deletion_turned_on);
                UPDATE migration_version SET version = 1;",
            )?;
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn();
        let version = conn.query_row("SELECT version FROM migration_version", [], |row| row.get(0))?;
        Ok(version)
    }
}
