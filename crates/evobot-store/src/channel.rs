// ABOUTME: Snapshot store that keeps each key's chunks as pinned messages in a reserved chat channel.
// ABOUTME: Maintains a lazily built key index, serializes writes per key, and retries transport hiccups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evobot_core::{ChannelId, MessageId};
use serde_json::Value;

use crate::backend::{Backend, BackendKind};
use crate::codec::{CodecError, SnapshotChunk, SnapshotCodec};
use crate::error::{StoreError, validate_key};
use crate::retry::{Exhausted, RetryPolicy};
use crate::transport::{ChatMessage, ChatTransport, TransportError};

/// First line of every message written by the store.
pub const MARKER: &str = "===EVOSTORE===";

/// Raw payload bytes per message. Base64 plus the envelope keeps a chunk
/// under the platform's 2000 character message limit.
pub const DEFAULT_CHUNK_LIMIT: usize = 1200;

/// Largest chunk limit that still fits the message limit with the longest
/// valid key and ten-digit chunk counters.
pub const MAX_CHUNK_LIMIT: usize = 1240;

#[derive(Debug, Clone, Copy)]
pub struct ChannelStoreOptions {
    pub chunk_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for ChannelStoreOptions {
    fn default() -> Self {
        Self {
            chunk_limit: DEFAULT_CHUNK_LIMIT,
            retry: RetryPolicy::default(),
        }
    }
}

/// The messages currently holding a key's snapshot, in chunk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub key: String,
    pub handles: Vec<MessageId>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Index {
    records: HashMap<String, StoreRecord>,
    /// Set once a scan has walked every pinned message without an early stop.
    fully_scanned: bool,
}

/// Persists snapshots as pinned messages in one reserved channel.
pub struct ChannelStore {
    transport: Arc<dyn ChatTransport>,
    channel: ChannelId,
    codec: SnapshotCodec,
    retry: RetryPolicy,
    index: Mutex<Index>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChannelStore {
    pub fn new(transport: Arc<dyn ChatTransport>, channel: ChannelId, options: ChannelStoreOptions) -> Self {
        Self {
            transport,
            channel,
            codec: SnapshotCodec::new(options.chunk_limit),
            retry: options.retry,
            index: Mutex::new(Index::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// The indexed record for `key`, without touching the transport.
    pub fn record(&self, key: &str) -> Option<StoreRecord> {
        self.index_guard().records.get(key).cloned()
    }

    fn index_guard(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Find the messages holding `key`, scanning pinned messages if the index
    /// does not know it yet.
    async fn locate(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        {
            let index = self.index_guard();
            if let Some(record) = index.records.get(key) {
                return Ok(Some(record.clone()));
            }
            if index.fully_scanned {
                return Ok(None);
            }
        }

        let pinned = self
            .retry
            .run("pinned_messages", || self.transport.pinned_messages(self.channel))
            .await
            .map_err(|e| StoreError::from_exhausted(key, e))?;

        let mut scan = Scan::default();
        let outcome = pinned
            .iter()
            .try_for_each(|message| scan.observe(message, key));

        let now = Utc::now();
        let mut index = self.index_guard();
        for record in scan.into_records(now) {
            index.records.entry(record.key.clone()).or_insert(record);
        }
        match outcome {
            ControlFlow::Break(()) => tracing::debug!("located '{}' before end of pinned messages", key),
            ControlFlow::Continue(()) => index.fully_scanned = true,
        }
        Ok(index.records.get(key).cloned())
    }

    async fn read(&self, key: &str) -> Result<Value, StoreError> {
        let record = self
            .locate(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let mut chunks = Vec::with_capacity(record.handles.len());
        for handle in &record.handles {
            let message = match self
                .retry
                .run("fetch_message", || self.transport.fetch_message(self.channel, *handle))
                .await
            {
                Ok(message) => message,
                Err(Exhausted {
                    error: TransportError::NotFound,
                    ..
                }) => {
                    return Err(StoreError::CorruptSnapshot {
                        key: key.to_string(),
                        reason: format!("chunk message {} no longer exists", handle),
                    });
                }
                Err(e) => return Err(StoreError::from_exhausted(key, e)),
            };

            let chunk = parse_chunk(&message.content).ok_or_else(|| StoreError::CorruptSnapshot {
                key: key.to_string(),
                reason: format!("message {} is not a snapshot chunk", handle),
            })?;
            chunks.push(chunk);
        }

        let bytes = self
            .codec
            .decode_bytes(chunks)
            .map_err(|e| StoreError::corrupt(key, e))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(key, e.into()))
    }

    /// Caller must hold the key lock.
    async fn write(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let chunks = self.codec.encode(key, value).map_err(|e| match e {
            CodecError::Json(e) => StoreError::Serialization(e),
            other => StoreError::corrupt(key, other),
        })?;
        let existing = self.locate(key).await?.map(|r| r.handles).unwrap_or_default();

        let mut handles = Vec::with_capacity(chunks.len());
        for (position, chunk) in chunks.iter().enumerate() {
            let body = render_chunk(chunk)?;
            let handle = match existing.get(position) {
                Some(&handle) => self.overwrite(key, handle, &body).await?,
                None => self.publish(key, &body).await?,
            };
            handles.push(handle);
        }

        for &surplus in existing.iter().skip(chunks.len()) {
            self.remove(key, surplus).await?;
        }

        let record = StoreRecord {
            key: key.to_string(),
            handles,
            updated_at: Utc::now(),
        };
        tracing::debug!(
            "wrote '{}' as {} chunk message(s) in channel {}",
            key,
            record.handles.len(),
            self.channel
        );
        self.index_guard().records.insert(key.to_string(), record);
        Ok(())
    }

    /// Edit a chunk message in place, recreating it if it has vanished.
    async fn overwrite(&self, key: &str, handle: MessageId, body: &str) -> Result<MessageId, StoreError> {
        match self
            .retry
            .run("edit_message", || self.transport.edit_message(self.channel, handle, body))
            .await
        {
            Ok(()) => Ok(handle),
            Err(Exhausted {
                error: TransportError::NotFound,
                ..
            }) => {
                tracing::warn!("chunk message {} for '{}' disappeared, recreating it", handle, key);
                self.publish(key, body).await
            }
            Err(e) => Err(StoreError::from_exhausted(key, e)),
        }
    }

    async fn publish(&self, key: &str, body: &str) -> Result<MessageId, StoreError> {
        let handle = self
            .retry
            .run("send_message", || self.transport.send_message(self.channel, body))
            .await
            .map_err(|e| StoreError::from_exhausted(key, e))?;
        self.retry
            .run("pin_message", || self.transport.pin_message(self.channel, handle))
            .await
            .map_err(|e| StoreError::from_exhausted(key, e))?;
        Ok(handle)
    }

    async fn remove(&self, key: &str, handle: MessageId) -> Result<(), StoreError> {
        match self
            .retry
            .run("delete_message", || self.transport.delete_message(self.channel, handle))
            .await
        {
            Ok(())
            | Err(Exhausted {
                error: TransportError::NotFound,
                ..
            }) => Ok(()),
            Err(e) => Err(StoreError::from_exhausted(key, e)),
        }
    }
}

#[async_trait]
impl Backend for ChannelStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Channel
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        validate_key(key)?;
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.write(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        validate_key(key)?;
        self.read(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let Some(record) = self.locate(key).await? else {
            return Ok(());
        };
        for &handle in &record.handles {
            self.remove(key, handle).await?;
        }
        self.index_guard().records.remove(key);
        tracing::debug!("deleted '{}' ({} chunk message(s))", key, record.handles.len());
        Ok(())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: &Value) -> Result<bool, StoreError> {
        validate_key(key)?;
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let current = match self.read(key).await {
            Ok(value) => Some(value),
            Err(StoreError::NotFound(_)) => None,
            Err(err @ StoreError::CorruptSnapshot { .. }) => {
                tracing::warn!("treating unreadable '{}' as absent: {}", key, err);
                None
            }
            Err(err) => return Err(err),
        };

        if current.as_ref() != expected {
            return Ok(false);
        }
        self.write(key, new).await?;
        Ok(true)
    }
}

/// Chunks seen while walking pinned messages, grouped by key.
#[derive(Default)]
struct Scan {
    found: BTreeMap<String, Vec<(u32, MessageId)>>,
}

impl Scan {
    /// Record one message. Breaks once every chunk index of `target` has
    /// been seen.
    fn observe(&mut self, message: &ChatMessage, target: &str) -> ControlFlow<()> {
        let Some(chunk) = parse_chunk(&message.content) else {
            return ControlFlow::Continue(());
        };
        let entries = self.found.entry(chunk.key.clone()).or_default();
        entries.push((chunk.chunk_index, message.id));

        if chunk.key == target {
            let seen: HashSet<u32> = entries.iter().map(|(index, _)| *index).collect();
            if (0..chunk.total_chunks).all(|index| seen.contains(&index)) {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn into_records(self, now: DateTime<Utc>) -> impl Iterator<Item = StoreRecord> {
        self.found.into_iter().map(move |(key, mut entries)| {
            entries.sort_by_key(|(index, id)| (*index, *id));
            StoreRecord {
                key,
                handles: entries.into_iter().map(|(_, id)| id).collect(),
                updated_at: now,
            }
        })
    }
}

fn render_chunk(chunk: &SnapshotChunk) -> Result<String, StoreError> {
    let json = serde_json::to_string(chunk)?;
    Ok(format!("{MARKER}\n```json\n{json}\n```"))
}

/// `None` for messages that are not store chunks.
fn parse_chunk(content: &str) -> Option<SnapshotChunk> {
    let body = content.trim().strip_prefix(MARKER)?.trim();
    let json = body.strip_prefix("```json")?.strip_suffix("```")?.trim();
    match serde_json::from_str(json) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            tracing::debug!("skipping malformed store message: {}", e);
            None
        }
    }
}
