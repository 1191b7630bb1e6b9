//! Error taxonomy for the orchestration core

use std::time::Duration;

/// Core errors
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Thread {thread_id} is busy (lock wait exceeded {waited:?})")]
    LockTimeout { thread_id: String, waited: Duration },

    #[error("Turn aborted by caller")]
    Aborted,

    #[error("Nothing to compact: {events} events, keeping {keep_recent}")]
    NothingToCompact { events: usize, keep_recent: usize },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Agent failed: {0}")]
    Agent(String),

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Lock timeouts surface as "agent busy" rather than a generic failure
    pub fn is_busy(&self) -> bool {
        matches!(self, CoreError::LockTimeout { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, CoreError::Aborted)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
