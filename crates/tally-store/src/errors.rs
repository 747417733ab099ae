//! Error types for snapshot store operations.
//!
//! Callers mostly care about two classes of failure: the owner does not
//! exist ([`StoreError::is_not_found`]) or the store cannot serve requests
//! right now ([`StoreError::is_unavailable`]). Everything else is an
//! internal fault surfaced for logging.

use tally_core::OwnerKey;
use thiserror::Error;

/// Errors that can occur during snapshot store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No snapshot exists for the owner.
    #[error("owner not found: {0}")]
    NotFound(OwnerKey),

    /// The store is not accepting requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Stored payload is not valid JSON.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },
}

impl StoreError {
    /// The owner has no snapshot.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The store could not be reached. A pool timeout counts, as does a
    /// database that is busy, locked, unopenable or failing I/O.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Pool(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;
