// ABOUTME: Error type shared by every persistence backend and the typed Store facade.
// ABOUTME: Separates corruption, absence, transient unavailability, and configuration mistakes.

use thiserror::Error;

use crate::backend::BackendKind;
use crate::codec::CodecError;
use crate::retry::Exhausted;
use crate::sqlite::SqliteError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot for key '{key}' is corrupt: {reason}")]
    CorruptSnapshot { key: String, reason: String },

    #[error("no snapshot stored under key '{0}'")]
    NotFound(String),

    #[error("store unavailable for key '{key}' after {attempts} attempts: {reason}")]
    TransientUnavailable {
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("store operation on key '{key}' timed out")]
    Timeout { key: String },

    #[error("backend already resolved as {active}, cannot switch to {requested}")]
    BackendSwitch {
        active: BackendKind,
        requested: BackendKind,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] SqliteError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid key '{0}'")]
    InvalidKey(String),
}

impl StoreError {
    /// A snapshot that failed to reassemble or to decode as the requested type.
    pub(crate) fn corrupt(key: &str, err: CodecError) -> Self {
        Self::CorruptSnapshot {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }

    /// Map a transport failure that survived retries onto the store taxonomy.
    pub(crate) fn from_exhausted(key: &str, exhausted: Exhausted) -> Self {
        if exhausted.error.is_retryable() {
            Self::TransientUnavailable {
                key: key.to_string(),
                attempts: exhausted.attempts,
                reason: exhausted.error.to_string(),
            }
        } else {
            Self::Transport(exhausted.error)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::CorruptSnapshot { .. })
    }
}

/// Keys become part of message bodies and SQL rows; keep them printable and short.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
