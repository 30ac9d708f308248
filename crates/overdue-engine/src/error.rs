//! Engine-wide error type.
//!
//! Lock contention is deliberately not represented here: failing to take
//! an order lock is an ordinary skip, reported through `try_lock`'s
//! boolean rather than an error.

use overdue_core::ClassifyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("lock error: {0}")]
    Lock(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error("fee calculation error: {0}")]
    Fee(String),

    #[error("notification error: {0}")]
    Notify(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("remediation error: {0}")]
    Remediation(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Store(format!("payload encoding failed: {err}"))
    }
}

#[cfg(feature = "sqlite-persistence")]
impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}
