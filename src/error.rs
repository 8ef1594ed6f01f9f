//! Error types: configuration, transport, scan consistency, and storage.
//!
//! Every failure a room task can hit maps onto one `ErrorKind`. Only the
//! affected room's loop ends on these; the process keeps running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DestroyerError {
    #[error("message delay not configured for room {room_id}")]
    DelayNotSet { room_id: String },

    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("transport error{}: {reason}", fmt_status(.status))]
    Transport { status: Option<u16>, reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("consistency violation in room {room_id}: {reason}")]
    Consistency { room_id: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User must fix the room policy and retry.
    Configuration,
    /// Remote call failed. Retryable by restarting the room loop.
    Transport,
    /// Scan found history in a state the cursor says is impossible.
    Consistency,
    /// Local persistence failed.
    Storage,
}

impl DestroyerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DestroyerError::DelayNotSet { .. } | DestroyerError::Config { .. } => {
                ErrorKind::Configuration
            }
            DestroyerError::Transport { .. } | DestroyerError::Http(_) => ErrorKind::Transport,
            DestroyerError::Consistency { .. } => ErrorKind::Consistency,
            DestroyerError::Database(_)
            | DestroyerError::Serialization(_)
            | DestroyerError::Io(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn transport(status: Option<u16>, reason: impl Into<String>) -> Self {
        DestroyerError::Transport {
            status,
            reason: reason.into(),
        }
    }

    pub(crate) fn consistency(room_id: &str, reason: impl Into<String>) -> Self {
        DestroyerError::Consistency {
            room_id: room_id.to_string(),
            reason: reason.into(),
        }
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, DestroyerError>;
