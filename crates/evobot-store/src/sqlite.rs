// ABOUTME: SQLite backend storing one snapshot envelope row per key.
// ABOUTME: Runs rusqlite calls on the blocking pool and uses immediate transactions for compare-and-swap.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;
use thiserror::Error;

use crate::backend::{Backend, BackendKind};
use crate::codec::{CodecError, SnapshotChunk, SnapshotCodec};
use crate::error::{StoreError, validate_key};

/// Errors that can occur inside the SQLite backend.
#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Relational backend. The envelope is the same one the channel store
/// writes, kept as a single unsplit chunk per row.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteBackend {
    /// Open or create the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                key TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                payload BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;

        tracing::info!("opened sqlite store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(SqliteError::from)?
    }
}

fn read_row(conn: &Connection, key: &str) -> Result<Option<SnapshotChunk>, StoreError> {
    let row = conn
        .query_row(
            "SELECT schema_version, checksum, payload FROM snapshots WHERE key = ?1",
            params![key],
            |row| {
                Ok(SnapshotChunk {
                    key: key.to_string(),
                    schema_version: row.get(0)?,
                    chunk_index: 0,
                    total_chunks: 1,
                    checksum: row.get(1)?,
                    payload: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(SqliteError::from)?;
    Ok(row)
}

fn decode_row(key: &str, chunk: SnapshotChunk) -> Result<Value, StoreError> {
    SnapshotCodec::unbounded()
        .decode(vec![chunk])
        .map_err(|e| StoreError::corrupt(key, e))
}

fn write_row(conn: &Connection, key: &str, value: &Value) -> Result<(), StoreError> {
    let mut chunks = SnapshotCodec::unbounded().encode(key, value).map_err(|e| match e {
        CodecError::Json(e) => StoreError::Serialization(e),
        other => StoreError::corrupt(key, other),
    })?;
    let chunk = chunks.remove(0);
    conn.execute(
        "INSERT INTO snapshots (key, schema_version, checksum, payload, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(key) DO UPDATE SET
            schema_version = excluded.schema_version,
            checksum = excluded.checksum,
            payload = excluded.payload,
            updated_at = excluded.updated_at",
        params![
            key,
            chunk.schema_version,
            chunk.checksum,
            chunk.payload,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(SqliteError::from)?;
    Ok(())
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        validate_key(key)?;
        let key = key.to_string();
        let value = value.clone();
        self.with_conn(move |conn| write_row(conn, &key, &value)).await
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| match read_row(conn, &key)? {
            Some(chunk) => decode_row(&key, chunk),
            None => Err(StoreError::NotFound(key)),
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM snapshots WHERE key = ?1", params![key])
                .map_err(SqliteError::from)?;
            Ok(())
        })
        .await
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&Value>, new: &Value) -> Result<bool, StoreError> {
        validate_key(key)?;
        let key = key.to_string();
        let expected = expected.cloned();
        let new = new.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(SqliteError::from)?;

            let current = match read_row(&tx, &key)? {
                Some(chunk) => match decode_row(&key, chunk) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        tracing::warn!("treating unreadable '{}' as absent: {}", key, err);
                        None
                    }
                },
                None => None,
            };

            if current != expected {
                return Ok(false);
            }
            write_row(&tx, &key, &new)?;
            tx.commit().map_err(SqliteError::from)?;
            Ok(true)
        })
        .await
    }
}
