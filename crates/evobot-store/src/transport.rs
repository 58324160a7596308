// ABOUTME: The chat transport capability the channel store persists through.
// ABOUTME: Defines message operations, pinned-message listing, and the error taxonomy used for backoff.

use std::time::Duration;

use async_trait::async_trait;
use evobot_core::{ChannelId, MessageId};
use thiserror::Error;

/// Errors reported by a chat transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The platform asked us to slow down. `retry_after` is its hint, if any.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// A transient failure (network error, 5xx) worth retrying.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("message or channel not found")]
    NotFound,

    /// A permanent refusal (permissions, malformed request).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }
}

/// A message as seen through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub content: String,
    pub pinned: bool,
}

/// Message operations the store needs from the chat platform.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, channel: ChannelId, content: &str) -> Result<MessageId, TransportError>;

    async fn edit_message(&self, channel: ChannelId, message: MessageId, content: &str) -> Result<(), TransportError>;

    async fn pin_message(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError>;

    async fn fetch_message(&self, channel: ChannelId, message: MessageId) -> Result<ChatMessage, TransportError>;

    async fn delete_message(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError>;

    /// All pinned messages of `channel`, newest first.
    async fn pinned_messages(&self, channel: ChannelId) -> Result<Vec<ChatMessage>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(TransportError::RateLimited { retry_after: None }.is_retryable());
        assert!(TransportError::Unavailable("502".to_string()).is_retryable());
        assert!(!TransportError::NotFound.is_retryable());
        assert!(!TransportError::Rejected("403".to_string()).is_retryable());
    }
}
