// ABOUTME: Capabilities the conversation flow and event lifecycle need from the chat platform.
// ABOUTME: Role allocation with an expiry, role release, and publishing event announcements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evobot_core::{MessageId, RoleId, ScheduledEvent};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("rate limited")]
    RateLimited,

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Failed(String),
}

/// Allocates the temporary access-control role attached to a confirmed event.
#[async_trait]
pub trait RoleManager: Send + Sync {
    /// Create a role named `name`. `expires_at` is when the event ends; the
    /// lifecycle sweep releases the role then.
    async fn allocate(&self, name: &str, expires_at: DateTime<Utc>) -> Result<RoleId, CollaboratorError>;

    /// Remove the role. Releasing a role that no longer exists succeeds.
    async fn release(&self, role: RoleId) -> Result<(), CollaboratorError>;
}

/// Publishes a notice for a newly confirmed event.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, event: &ScheduledEvent) -> Result<Option<MessageId>, CollaboratorError>;
}

/// Role name for an event: `"{prefix} - {title}"`, kept within the
/// platform's 100 character limit.
pub fn participant_role_name(prefix: &str, title: &str) -> String {
    format!("{} - {}", prefix, title).chars().take(100).collect()
}
