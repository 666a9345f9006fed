//! Error taxonomy.
//!
//! Transition conflicts are deliberately absent: they are counted in outcomes,
//! never raised.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity/timeout class failures; eligible for retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate message fingerprint: {0}")]
    DuplicateFingerprint(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::DuplicateFingerprint(db.message().to_string())
            }
            sqlx::Error::Database(ref db) if is_busy(db.message()) => {
                StoreError::Unavailable(db.message().to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

fn is_busy(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("database is locked") || m.contains("busy")
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input; nothing was applied.
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store circuit open; retry in {retry_in_ms} ms")]
    CircuitOpen { retry_in_ms: u64 },
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
