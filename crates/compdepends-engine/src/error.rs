//! Engine error types.

use compdepends_store::StoreError;
use thiserror::Error;

/// Errors that can occur while maintaining dependencies.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[source] StoreError),

    #[error("lock for application '{app}' is held by {holder}")]
    LockBusy { app: String, holder: String },

    #[error("lock for application '{0}' was lost")]
    LockLost(String),

    #[error("application not found: {0}")]
    AppNotFound(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockBusy { app, holder } => EngineError::LockBusy { app, holder },
            StoreError::LockLost(app) => EngineError::LockLost(app),
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    /// Errors the daemon must exit on rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::LockBusy { .. } | EngineError::LockLost(_) | EngineError::AppNotFound(_)
        )
    }

    /// Errors answered by dropping the store and reconnecting.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_connectivity())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_lock_errors_become_fatal() {
        let busy: EngineError = StoreError::LockBusy {
            app: "compdepends".into(),
            holder: "host:1".into(),
        }
        .into();
        assert!(busy.is_fatal());
        assert!(!busy.is_connectivity());

        let lost: EngineError = StoreError::LockLost("compdepends".into()).into();
        assert!(lost.is_fatal());
    }

    #[test]
    fn io_failures_are_connectivity() {
        let e: EngineError = StoreError::Transaction("disk gone".into()).into();
        assert!(e.is_connectivity());
        assert!(!e.is_fatal());

        let e: EngineError = StoreError::Deserialize("bad json".into()).into();
        assert!(!e.is_connectivity());
    }
}
