// ABOUTME: Persistence layer for evobot, the only state that survives a restart.
// ABOUTME: Provides the snapshot codec, chat-channel and SQLite backends, backend selection, leader lease, and legacy migration.

pub mod backend;
pub mod channel;
pub mod codec;
pub mod error;
pub mod leader;
pub mod migrate;
pub mod retry;
pub mod selector;
pub mod sqlite;
pub mod testing;
pub mod transport;

pub use backend::{Backend, BackendKind, DEFAULT_OP_TIMEOUT, Store};
pub use channel::{ChannelStore, ChannelStoreOptions, StoreRecord};
pub use codec::{CodecError, SCHEMA_VERSION, SnapshotChunk, SnapshotCodec};
pub use error::StoreError;
pub use leader::{LEASE_KEY, LeaderError, LeaderGuard, LeaderOptions};
pub use migrate::{IdentityResolver, LegacyKeyMigrator, MigrationReport, PartialMigration};
pub use retry::RetryPolicy;
pub use selector::{BackendConfig, BackendSelector, ChannelConfig};
pub use sqlite::{SqliteBackend, SqliteError};
pub use transport::{ChatMessage, ChatTransport, TransportError};
