//! Error types for the store.

use tether_core::{PersistenceError, PersistenceOperation};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// A stored value could not be decoded.
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Wrap into the cross-crate [`PersistenceError`].
    pub fn into_persistence(self, table: &str, operation: PersistenceOperation) -> PersistenceError {
        PersistenceError::new(table, operation, self.to_string()).with_source(self)
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
