//! Error types shared by the core domain types.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid interval '{spec}': {reason}")]
    InvalidInterval { spec: String, reason: String },

    #[error("invalid time-series identifier '{0}'")]
    InvalidTsid(String),
}
