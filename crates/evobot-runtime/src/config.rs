// ABOUTME: Runtime configuration loading and validation for the evobot process.
// ABOUTME: Reads EVOBOT_* and provider environment variables and derives store, lease, and flow options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use evobot_agent::FlowOptions;
use evobot_core::{ChannelId, DraftRules};
use evobot_store::channel::{DEFAULT_CHUNK_LIMIT, MAX_CHUNK_LIMIT};
use evobot_store::{BackendConfig, ChannelConfig, ChannelStoreOptions, ChatTransport, LeaderOptions};
use thiserror::Error;
use ulid::Ulid;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{var} is not a valid number: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("EVOBOT_LEASE_RENEW_SECS ({renew}) must be below EVOBOT_LEASE_TTL_SECS ({ttl})")]
    RenewNotBelowTtl { renew: u64, ttl: u64 },

    #[error("EVOBOT_UTC_OFFSET_MINUTES is out of range: {0}")]
    InvalidOffset(i32),

    #[error("{var} is too large: {value}")]
    TooLarge { var: &'static str, value: u64 },

    #[error("EVOBOT_CHUNK_LIMIT must be between 1 and {max}: {value}")]
    InvalidChunkLimit { value: usize, max: usize },
}

/// Credentials for the OpenAI-compatible synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub discord_token: Option<String>,
    pub guild_id: Option<u64>,
    pub store_channel: Option<ChannelId>,
    pub announce_channel: Option<ChannelId>,
    pub database_path: Option<PathBuf>,
    pub instance_id: String,
    pub lease_ttl: Duration,
    pub lease_renew: Duration,
    pub lease_max_failures: u32,
    pub conversation_timeout: Duration,
    pub store_timeout: Duration,
    pub chunk_limit: usize,
    pub termination_token: String,
    pub local_offset: FixedOffset,
    pub migrate_keys: Vec<String>,
    pub participant_role: String,
    pub openai: Option<OpenAiConfig>,
}

impl RuntimeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set. Blank values count as unset.
    ///
    /// Either EVOBOT_DATABASE_PATH or EVOBOT_STORE_CHANNEL_ID (with
    /// DISCORD_TOKEN) must be present so there is somewhere to persist to.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let discord_token = get("DISCORD_TOKEN");
        let guild_id = parse_opt(&get, "EVOBOT_GUILD_ID")?;
        let store_channel = parse_opt(&get, "EVOBOT_STORE_CHANNEL_ID")?.map(ChannelId);
        let announce_channel = parse_opt(&get, "EVOBOT_ANNOUNCE_CHANNEL_ID")?.map(ChannelId);
        let database_path = get("EVOBOT_DATABASE_PATH").map(PathBuf::from);

        if database_path.is_none() {
            if store_channel.is_none() {
                return Err(ConfigError::Missing("EVOBOT_STORE_CHANNEL_ID"));
            }
            if discord_token.is_none() {
                return Err(ConfigError::Missing("DISCORD_TOKEN"));
            }
        }

        let lease_ttl: u64 = parse_or(&get, "EVOBOT_LEASE_TTL_SECS", 60)?;
        check_seconds("EVOBOT_LEASE_TTL_SECS", lease_ttl)?;
        let lease_renew: u64 = parse_or(&get, "EVOBOT_LEASE_RENEW_SECS", 20)?;
        if lease_renew >= lease_ttl {
            return Err(ConfigError::RenewNotBelowTtl {
                renew: lease_renew,
                ttl: lease_ttl,
            });
        }

        let offset_minutes: i32 = parse_or(&get, "EVOBOT_UTC_OFFSET_MINUTES", 60)?;
        let local_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ConfigError::InvalidOffset(offset_minutes))?;

        let conversation_timeout: u64 = parse_or(&get, "EVOBOT_CONVERSATION_TIMEOUT_SECS", 900)?;
        check_seconds("EVOBOT_CONVERSATION_TIMEOUT_SECS", conversation_timeout)?;

        let chunk_limit: usize = parse_or(&get, "EVOBOT_CHUNK_LIMIT", DEFAULT_CHUNK_LIMIT)?;
        if chunk_limit == 0 || chunk_limit > MAX_CHUNK_LIMIT {
            return Err(ConfigError::InvalidChunkLimit {
                value: chunk_limit,
                max: MAX_CHUNK_LIMIT,
            });
        }

        let openai = get("OPENAI_API_KEY").map(|api_key| OpenAiConfig {
            api_key,
            base_url: get("OPENAI_BASE_URL"),
            model: get("OPENAI_MODEL"),
        });

        Ok(Self {
            discord_token,
            guild_id,
            store_channel,
            announce_channel,
            database_path,
            instance_id: get("EVOBOT_INSTANCE_ID").unwrap_or_else(|| Ulid::new().to_string()),
            lease_ttl: Duration::from_secs(lease_ttl),
            lease_renew: Duration::from_secs(lease_renew),
            lease_max_failures: parse_or(&get, "EVOBOT_LEASE_MAX_FAILURES", 3)?,
            conversation_timeout: Duration::from_secs(conversation_timeout),
            store_timeout: Duration::from_secs(parse_or(&get, "EVOBOT_STORE_TIMEOUT_SECS", 30)?),
            chunk_limit,
            termination_token: get("EVOBOT_TERMINATION_TOKEN").unwrap_or_else(|| "terminé".to_string()),
            local_offset,
            migrate_keys: get("EVOBOT_MIGRATE_KEYS")
                .unwrap_or_else(|| "jobs".to_string())
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
            participant_role: get("EVOBOT_PARTICIPANT_ROLE").unwrap_or_else(|| "Event participants".to_string()),
            openai,
        })
    }

    /// Where snapshots live. `transport` is the chat transport for the
    /// channel store; without one only a database path can be used.
    pub fn backend_config(&self, transport: Option<Arc<dyn ChatTransport>>) -> Result<BackendConfig, ConfigError> {
        let channel = match (transport, self.store_channel) {
            (Some(transport), Some(channel)) => Some(ChannelConfig {
                transport,
                channel,
                options: ChannelStoreOptions {
                    chunk_limit: self.chunk_limit,
                    ..ChannelStoreOptions::default()
                },
            }),
            _ => None,
        };

        match (&self.database_path, channel) {
            (Some(path), fallback) => Ok(BackendConfig::Sqlite {
                path: path.clone(),
                fallback,
            }),
            (None, Some(channel)) => Ok(BackendConfig::Channel(channel)),
            (None, None) => Err(ConfigError::Missing("EVOBOT_STORE_CHANNEL_ID")),
        }
    }

    pub fn leader_options(&self) -> LeaderOptions {
        LeaderOptions {
            ttl: seconds(self.lease_ttl),
            max_renew_failures: self.lease_max_failures,
        }
    }

    pub fn flow_options(&self) -> FlowOptions {
        FlowOptions {
            inactivity_timeout: seconds(self.conversation_timeout),
            termination_token: self.termination_token.clone(),
            draft_rules: DraftRules {
                local_offset: self.local_offset,
                ..DraftRules::default()
            },
        }
    }
}

/// Reject second counts too large for the lease and timeout arithmetic.
fn check_seconds(var: &'static str, value: u64) -> Result<(), ConfigError> {
    i64::try_from(value)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .map(|_| ())
        .ok_or(ConfigError::TooLarge { var, value })
}

/// Loading already bounded these durations; anything larger saturates.
fn seconds(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}

fn parse_opt<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| value.parse().map_err(|_| ConfigError::InvalidNumber { var, value }))
        .transpose()
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(get, var)?.unwrap_or(default))
}
