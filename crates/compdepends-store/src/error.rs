//! Error types for the time-series store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("lock for application '{app}' is held by {holder}")]
    LockBusy { app: String, holder: String },

    #[error("lock for application '{0}' is no longer held by this process")]
    LockLost(String),
}

impl StoreError {
    /// Failures of the underlying database rather than of the data in it.
    ///
    /// The daemon answers these by closing the store and reconnecting.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            StoreError::Open(_)
                | StoreError::Transaction(_)
                | StoreError::Table(_)
                | StoreError::Read(_)
                | StoreError::Write(_)
        )
    }
}
