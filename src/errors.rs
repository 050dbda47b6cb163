use crate::models::RETENTION_NOT_SUPPORTED;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("STORAGE_FAILURE: {0}")]
    Storage(String),
    #[error("VALIDATION_FAILED: {0}")]
    Validation(String),
    #[error("MALFORMED_ROW: {0}")]
    MalformedRow(String),
    #[error("NOT_SUPPORTED: {0}")]
    NotSupported(String),
    #[error("STORE_BUSY: {0}")]
    Busy(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl StoreError {
    /// Integer form of a retention result for hosts that still compare against
    /// `RETENTION_NOT_SUPPORTED`. Other errors have no sentinel.
    pub fn retention_sentinel(&self) -> Option<i64> {
        matches!(self, Self::NotSupported(_)).then_some(RETENTION_NOT_SUPPORTED)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedRow(value.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
