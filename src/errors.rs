//! Error taxonomy for the sync engine.
//!
//! The coordinator catches these per object; no single object's error may
//! abort a whole pass. `Config` errors mark the target record instead of
//! crashing the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid or revoked remote credential, unreachable endpoint or a
    /// malformed target record. Fatal for the bucket's pass, never retried
    /// within it.
    #[error("backup target misconfigured: {0}")]
    Config(String),

    /// Remote-reported or locally-detected MD5 mismatch. Triggers the
    /// chunked fallback rather than a hard failure.
    #[error("integrity mismatch for `{key}`: {reason}")]
    IntegrityMismatch { key: String, reason: String },

    /// Timeout, connection reset or a 5xx from the remote. The object stays
    /// a candidate and is retried on the next pass.
    #[error("transfer of `{key}` failed: {reason}")]
    Transfer { key: String, reason: String },

    /// The object's payload is gone from the data path.
    #[error("object data `{0}` not found")]
    DataNotFound(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn is_config(&self) -> bool {
        matches!(self, SyncError::Config(_))
    }

    /// Wrap an HTTP client failure as a transient transfer error for `key`.
    pub fn transfer(key: &str, reason: impl ToString) -> Self {
        SyncError::Transfer {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}
