// ABOUTME: Process-level wiring for evobot: environment configuration, the Discord adapter, and bootstrap.
// ABOUTME: Connects the store and agent crates to a real chat platform and runs the background loops.

pub mod app;
pub mod config;
pub mod discord;

pub use app::{App, AppError, Collaborators, SWEEP_INTERVAL, discord_client, migrate_tables, open_store};
pub use config::{ConfigError, OpenAiConfig, RuntimeConfig};
pub use discord::{DiscordClient, announcement_text};
