// ABOUTME: One-shot backend selection between the SQLite store and the chat-channel store.
// ABOUTME: The first resolution wins for the process lifetime; later requests for another kind are refused.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use evobot_core::ChannelId;
use tokio::sync::Mutex;

use crate::backend::{Backend, BackendKind, DEFAULT_OP_TIMEOUT, Store};
use crate::channel::{ChannelStore, ChannelStoreOptions};
use crate::error::StoreError;
use crate::sqlite::SqliteBackend;
use crate::transport::ChatTransport;

/// Where snapshots should live.
#[derive(Clone)]
pub struct ChannelConfig {
    pub transport: Arc<dyn ChatTransport>,
    pub channel: ChannelId,
    pub options: ChannelStoreOptions,
}

#[derive(Clone)]
pub enum BackendConfig {
    Channel(ChannelConfig),
    /// SQLite at `path`, falling back to `fallback` if the file cannot be opened.
    Sqlite {
        path: PathBuf,
        fallback: Option<ChannelConfig>,
    },
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Channel(_) => BackendKind::Channel,
            Self::Sqlite { .. } => BackendKind::Sqlite,
        }
    }
}

/// Resolves the process's backend exactly once.
pub struct BackendSelector {
    active: Mutex<Option<Store>>,
    op_timeout: Duration,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new(DEFAULT_OP_TIMEOUT)
    }
}

impl BackendSelector {
    pub fn new(op_timeout: Duration) -> Self {
        Self {
            active: Mutex::new(None),
            op_timeout,
        }
    }

    /// The store resolved so far, if any.
    pub async fn active(&self) -> Option<Store> {
        self.active.lock().await.clone()
    }

    /// Resolve `config` into the process's store. Asking again for the same
    /// kind returns the existing store; asking for another kind fails with
    /// `BackendSwitch`. A SQLite fallback counts as the channel kind.
    pub async fn resolve(&self, config: BackendConfig) -> Result<Store, StoreError> {
        let mut active = self.active.lock().await;

        if let Some(store) = active.as_ref() {
            let requested = config.kind();
            let fell_back = matches!(
                (&config, store.kind()),
                (BackendConfig::Sqlite { fallback: Some(_), .. }, BackendKind::Channel)
            );
            if store.kind() == requested || fell_back {
                return Ok(store.clone());
            }
            return Err(StoreError::BackendSwitch {
                active: store.kind(),
                requested,
            });
        }

        let store = Store::new(build(config)?).with_timeout(self.op_timeout);
        tracing::info!("persistence backend resolved: {}", store.kind());
        *active = Some(store.clone());
        Ok(store)
    }
}

fn build(config: BackendConfig) -> Result<Arc<dyn Backend>, StoreError> {
    match config {
        BackendConfig::Channel(channel) => Ok(channel_store(channel)),
        BackendConfig::Sqlite { path, fallback } => match SqliteBackend::open(&path) {
            Ok(backend) => Ok(Arc::new(backend)),
            Err(err) => match fallback {
                Some(channel) => {
                    tracing::warn!(
                        "could not open sqlite store at {} ({}), falling back to channel {}",
                        path.display(),
                        err,
                        channel.channel
                    );
                    Ok(channel_store(channel))
                }
                None => Err(err.into()),
            },
        },
    }
}

fn channel_store(config: ChannelConfig) -> Arc<dyn Backend> {
    Arc::new(ChannelStore::new(config.transport, config.channel, config.options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTransport;
    use serde_json::json;
    use tempfile::TempDir;

    fn channel_config(transport: &Arc<MemoryTransport>) -> ChannelConfig {
        ChannelConfig {
            transport: transport.clone(),
            channel: ChannelId(9),
            options: ChannelStoreOptions::default(),
        }
    }

    #[tokio::test]
    async fn sqlite_selected_when_path_configured() {
        let dir = TempDir::new().unwrap();
        let selector = BackendSelector::default();
        let store = selector
            .resolve(BackendConfig::Sqlite {
                path: dir.path().join("state.db"),
                fallback: None,
            })
            .await
            .unwrap();
        assert_eq!(store.kind(), BackendKind::Sqlite);
    }

    #[tokio::test]
    async fn same_kind_returns_existing_store() {
        let transport = Arc::new(MemoryTransport::new());
        let selector = BackendSelector::default();

        let first = selector
            .resolve(BackendConfig::Channel(channel_config(&transport)))
            .await
            .unwrap();
        first.put("jobs", &json!({"a": 1})).await.unwrap();

        let second = selector
            .resolve(BackendConfig::Channel(channel_config(&transport)))
            .await
            .unwrap();
        // Same instance: the write is already indexed, no rescan needed.
        let scans = transport.call_count("pinned_messages");
        assert_eq!(second.get_value("jobs").await.unwrap(), json!({"a": 1}));
        assert_eq!(transport.call_count("pinned_messages"), scans);
    }

    #[tokio::test]
    async fn switching_kinds_is_rejected() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let selector = BackendSelector::default();

        selector
            .resolve(BackendConfig::Channel(channel_config(&transport)))
            .await
            .unwrap();
        let err = selector
            .resolve(BackendConfig::Sqlite {
                path: dir.path().join("state.db"),
                fallback: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::BackendSwitch {
                active: BackendKind::Channel,
                requested: BackendKind::Sqlite
            }
        ));
    }

    #[tokio::test]
    async fn unusable_database_falls_back_to_channel() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let selector = BackendSelector::default();
        let config = BackendConfig::Sqlite {
            path: dir.path().join("missing/dir/state.db"),
            fallback: Some(channel_config(&transport)),
        };

        let store = selector.resolve(config.clone()).await.unwrap();
        assert_eq!(store.kind(), BackendKind::Channel);
        assert_eq!(selector.resolve(config).await.unwrap().kind(), BackendKind::Channel);
    }

    #[tokio::test]
    async fn unusable_database_without_fallback_fails() {
        let dir = TempDir::new().unwrap();
        let selector = BackendSelector::default();
        let err = selector
            .resolve(BackendConfig::Sqlite {
                path: dir.path().join("missing/dir/state.db"),
                fallback: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(selector.active().await.is_none());
    }
}
