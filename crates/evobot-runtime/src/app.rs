// ABOUTME: Process bootstrap and background loops for evobot.
// ABOUTME: Resolves the backend, takes the lease, migrates legacy tables, recovers sessions, then runs the sweeps.

use std::sync::Arc;
use std::time::Duration;

use evobot_agent::{
    Announcer, ConversationFlow, EventLifecycle, FlowError, OpenAiSynthesizer, RoleManager, Synthesizer,
};
use evobot_core::Clock;
use evobot_store::{
    BackendSelector, ChatTransport, IdentityResolver, LeaderError, LeaderGuard, MigrationReport, Store, StoreError,
};
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{ConfigError, RuntimeConfig};
use crate::discord::DiscordClient;

/// How often the event and conversation sweeps run.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("leader error: {0}")]
    Leader(#[from] LeaderError),

    #[error("conversation error: {0}")]
    Flow(#[from] FlowError),
}

/// The platform-facing pieces the core runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Option<Arc<dyn ChatTransport>>,
    pub roles: Arc<dyn RoleManager>,
    pub announcer: Arc<dyn Announcer>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Collaborators {
    /// Discord for everything platform-side and OpenAI for synthesis.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ConfigError> {
        let discord = Arc::new(discord_client(config)?);
        let openai = config.openai.as_ref().ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;
        let synthesizer = OpenAiSynthesizer::new(openai.api_key.clone(), openai.base_url.clone(), openai.model.clone());

        Ok(Self {
            transport: Some(discord.clone()),
            roles: discord.clone(),
            announcer: discord.clone(),
            resolver: discord,
            synthesizer: Arc::new(synthesizer),
        })
    }
}

pub fn discord_client(config: &RuntimeConfig) -> Result<DiscordClient, ConfigError> {
    let token = config.discord_token.clone().ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;
    Ok(DiscordClient::new(token, config.guild_id, config.announce_channel))
}

/// Resolve the configured backend. The channel store needs `transport`.
pub async fn open_store(config: &RuntimeConfig, transport: Option<Arc<dyn ChatTransport>>) -> Result<Store, AppError> {
    let selector = BackendSelector::new(config.store_timeout);
    Ok(selector.resolve(config.backend_config(transport)?).await?)
}

/// Migrate every configured member table, in order. `Store::migrate_legacy`
/// logs each report; a partial migration does not stop the pass.
pub async fn migrate_tables(
    store: &Store,
    keys: &[String],
    resolver: &dyn IdentityResolver,
) -> Result<Vec<(String, MigrationReport)>, StoreError> {
    let mut reports = Vec::with_capacity(keys.len());
    for key in keys {
        let report = store.migrate_legacy(key, resolver).await?;
        reports.push((key.clone(), report));
    }
    Ok(reports)
}

/// A bootstrapped evobot instance.
pub struct App {
    pub store: Store,
    pub leader: Arc<LeaderGuard>,
    pub lifecycle: Arc<EventLifecycle>,
    pub flow: Arc<ConversationFlow>,
    lease_renew: Duration,
    sweep_interval: Duration,
}

impl App {
    pub async fn bootstrap(
        config: &RuntimeConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let store = open_store(config, collaborators.transport.clone()).await?;

        let leader = Arc::new(LeaderGuard::new(
            store.clone(),
            config.instance_id.clone(),
            config.leader_options(),
            clock.clone(),
        ));
        match leader.acquire().await {
            Ok(true) => tracing::info!("instance {} is the leader", config.instance_id),
            Ok(false) => tracing::info!("instance {} starts as a follower", config.instance_id),
            Err(err) => tracing::warn!("lease acquisition failed, starting as a follower: {}", err),
        }

        if leader.is_leader() {
            migrate_tables(&store, &config.migrate_keys, collaborators.resolver.as_ref()).await?;
        } else {
            tracing::info!("skipping legacy migration while not leading");
        }

        let lifecycle = Arc::new(EventLifecycle::new(
            store.clone(),
            leader.clone(),
            collaborators.roles,
            collaborators.announcer,
            clock.clone(),
            &config.participant_role,
        ));
        let flow = Arc::new(ConversationFlow::new(
            store.clone(),
            leader.clone(),
            collaborators.synthesizer,
            lifecycle.clone(),
            clock,
            config.flow_options(),
        ));
        flow.recover().await?;

        Ok(Self {
            store,
            leader,
            lifecycle,
            flow,
            lease_renew: config.lease_renew,
            sweep_interval: SWEEP_INTERVAL,
        })
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Run the lease, event, and expiry loops until `shutdown` flips to
    /// true. The lease is released before this returns.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let lease = self.leader.clone().spawn(self.lease_renew, shutdown.clone());
        let events = self.lifecycle.clone().spawn(self.sweep_interval, shutdown.clone());
        let expiry = self.flow.clone().spawn_expiry(self.sweep_interval, shutdown);

        for (name, handle) in [("lease", lease), ("events", events), ("expiry", expiry)] {
            if let Err(err) = handle.await {
                tracing::error!("{} loop terminated abnormally: {}", name, err);
            }
        }
        tracing::info!("background loops stopped");
    }
}
