// ABOUTME: The backend capability interface and the typed Store facade built on top of it.
// ABOUTME: Store bounds every operation with a timeout and converts between domain types and JSON.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::CodecError;
use crate::error::StoreError;

/// Which persistence medium a backend writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Channel,
    Sqlite,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel => write!(f, "channel"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Keyed snapshot persistence. One live value per key; writing replaces.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Fails with `NotFound` for a key that was never written or was deleted.
    async fn get(&self, key: &str) -> Result<Value, StoreError>;

    /// Idempotent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Write `new` only if the current value equals `expected` (`None` meaning
    /// absent). A corrupt current value counts as absent. Returns whether the
    /// write happened.
    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: &Value) -> Result<bool, StoreError>;
}

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Typed, cloneable handle on the process's single backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    op_timeout: Duration,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("kind", &self.backend.kind())
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.put_value(key, &value).await
    }

    pub async fn put_value(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.bounded(key, self.backend.put(key, value)).await?;
        tracing::debug!("stored snapshot '{}' via {}", key, self.kind());
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let value = self.get_value(key).await?;
        serde_json::from_value(value).map_err(|e| StoreError::corrupt(key, CodecError::Json(e)))
    }

    pub async fn get_value(&self, key: &str) -> Result<Value, StoreError> {
        self.bounded(key, self.backend.get(key)).await
    }

    /// Like `get`, but an absent key is `None` and a corrupt snapshot is logged
    /// and also treated as `None`, so callers fall back to their empty state.
    pub async fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err @ StoreError::CorruptSnapshot { .. }) => {
                tracing::warn!("ignoring unreadable snapshot: {}", err);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.bounded(key, self.backend.delete(key)).await
    }

    pub async fn compare_and_swap<T: Serialize>(
        &self,
        key: &str,
        expected: Option<&T>,
        new: &T,
    ) -> Result<bool, StoreError> {
        let expected = expected.map(serde_json::to_value).transpose()?;
        let new = serde_json::to_value(new)?;
        self.bounded(key, self.backend.compare_and_swap(key, expected.as_ref(), &new))
            .await
    }

    async fn bounded<T, F>(&self, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("store operation on '{}' exceeded {:?}", key, self.op_timeout);
                Err(StoreError::Timeout {
                    key: key.to_string(),
                })
            }
        }
    }
}
