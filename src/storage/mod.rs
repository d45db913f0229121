//! Campaign persistence
//!
//! The scheduler only talks to storage through the traits in
//! [`repository`]. Two implementations are provided: SQLite for
//! production and an in-memory store for tests and dry runs.
//!
//! Instants are persisted as integer milliseconds since the epoch, so a
//! value read back compares equal to the value written as long as it was
//! millisecond-aligned (see [`crate::models::truncate_to_millis`]).

pub mod repository;

pub use repository::{
    CampaignStore, MemoryCampaignStore, PerformanceStore, RefreshTokenSource,
    SharedCampaignStore, SharedPerformanceStore, SqliteCampaignStore,
};

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Duplicate campaign id: {0}")]
    Duplicate(uuid::Uuid),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            StoreError::Unavailable(_) | StoreError::Io(_) => true,
            _ => false,
        }
    }
}
