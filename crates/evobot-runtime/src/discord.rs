// ABOUTME: Discord REST adapter implementing the chat transport, role, announcement, and identity capabilities.
// ABOUTME: Maps HTTP statuses onto TransportError, surfacing 429 responses with their retry_after hint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evobot_agent::{Announcer, CollaboratorError, RoleManager};
use evobot_core::{ChannelId, MessageId, RoleId, ScheduledEvent};
use evobot_store::{ChatMessage, ChatTransport, IdentityResolver, TransportError};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const MEMBER_SEARCH_LIMIT: u32 = 10;

/// A bot-token client for the subset of the Discord API evobot uses.
pub struct DiscordClient {
    client: reqwest::Client,
    token: String,
    api_base: String,
    guild_id: Option<u64>,
    announce_channel: Option<ChannelId>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    channel_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    pinned: bool,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMember {
    user: RawUser,
    #[serde(default)]
    nick: Option<String>,
}

impl DiscordClient {
    pub fn new(token: String, guild_id: Option<u64>, announce_channel: Option<ChannelId>) -> Self {
        Self::with_api_base(token, guild_id, announce_channel, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        token: String,
        guild_id: Option<u64>,
        announce_channel: Option<ChannelId>,
        api_base: &str,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            guild_id,
            announce_channel,
        }
    }

    fn guild(&self) -> Result<u64, CollaboratorError> {
        self.guild_id
            .ok_or_else(|| CollaboratorError::NotConfigured("EVOBOT_GUILD_ID".to_string()))
    }

    /// Send one request and return the parsed body (`Value::Null` for an
    /// empty body).
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, TransportError> {
        let url = format!("{}{}", self.api_base, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", format!("Bot {}", self.token));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let header_hint = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            tracing::debug!("discord {} {} returned {}", method, path, status);
            return Err(classify(status, &text, header_hint));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Rejected(format!("unreadable response: {}", e)))
    }
}

/// Map a failed response onto the transport taxonomy.
fn classify(status: StatusCode, body: &str, header_hint: Option<f64>) -> TransportError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let body_hint = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("retry_after").and_then(Value::as_f64));
            TransportError::RateLimited {
                retry_after: body_hint
                    .or(header_hint)
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(Duration::from_secs_f64),
            }
        }
        StatusCode::NOT_FOUND => TransportError::NotFound,
        s if s.is_server_error() => TransportError::Unavailable(format!("{}", s)),
        s => TransportError::Rejected(format!("{}: {}", s, body)),
    }
}

fn snowflake(raw: &str) -> Result<u64, TransportError> {
    raw.parse()
        .map_err(|_| TransportError::Rejected(format!("invalid snowflake: {}", raw)))
}

fn message_from(value: Value) -> Result<ChatMessage, TransportError> {
    let raw: RawMessage =
        serde_json::from_value(value).map_err(|e| TransportError::Rejected(format!("malformed message: {}", e)))?;
    Ok(ChatMessage {
        id: MessageId(snowflake(&raw.id)?),
        channel_id: ChannelId(snowflake(&raw.channel_id)?),
        content: raw.content,
        pinned: raw.pinned,
    })
}

fn collaborator(err: TransportError) -> CollaboratorError {
    match err {
        TransportError::RateLimited { .. } => CollaboratorError::RateLimited,
        other => CollaboratorError::Failed(other.to_string()),
    }
}

/// The member whose nickname, global name, or username equals
/// `display_name`, ignoring case.
fn matching_member(members: &[RawMember], display_name: &str) -> Option<String> {
    let wanted = display_name.trim().to_lowercase();
    members
        .iter()
        .find(|member| {
            [
                member.nick.as_deref(),
                member.user.global_name.as_deref(),
                Some(member.user.username.as_str()),
            ]
            .into_iter()
            .flatten()
            .any(|name| name.trim().to_lowercase() == wanted)
        })
        .map(|member| member.user.id.clone())
}

/// Announcement text for a confirmed event, using Discord's timestamp markup.
pub fn announcement_text(event: &ScheduledEvent) -> String {
    let mut text = format!(
        "**{}**\n{}\nStarts <t:{}:F>, ends <t:{}:F>",
        event.title,
        event.description,
        event.window.start.timestamp(),
        event.window.end.timestamp()
    );
    if let Some(location) = &event.location {
        text.push_str(&format!("\nLocation: {}", location));
    }
    if let Some(slots) = event.max_slots {
        text.push_str(&format!("\nSlots: {}", slots));
    }
    if let Some(role) = event.participant_role_id {
        text.push_str(&format!("\nParticipants: <@&{}>", role));
    }
    text
}

#[async_trait]
impl ChatTransport for DiscordClient {
    async fn send_message(&self, channel: ChannelId, content: &str) -> Result<MessageId, TransportError> {
        let value = self
            .call(
                Method::POST,
                &format!("/channels/{}/messages", channel),
                Some(json!({ "content": content })),
            )
            .await?;
        Ok(message_from(value)?.id)
    }

    async fn edit_message(&self, channel: ChannelId, message: MessageId, content: &str) -> Result<(), TransportError> {
        self.call(
            Method::PATCH,
            &format!("/channels/{}/messages/{}", channel, message),
            Some(json!({ "content": content })),
        )
        .await?;
        Ok(())
    }

    async fn pin_message(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError> {
        self.call(Method::PUT, &format!("/channels/{}/pins/{}", channel, message), None)
            .await?;
        Ok(())
    }

    async fn fetch_message(&self, channel: ChannelId, message: MessageId) -> Result<ChatMessage, TransportError> {
        let value = self
            .call(Method::GET, &format!("/channels/{}/messages/{}", channel, message), None)
            .await?;
        message_from(value)
    }

    async fn delete_message(&self, channel: ChannelId, message: MessageId) -> Result<(), TransportError> {
        self.call(Method::DELETE, &format!("/channels/{}/messages/{}", channel, message), None)
            .await?;
        Ok(())
    }

    async fn pinned_messages(&self, channel: ChannelId) -> Result<Vec<ChatMessage>, TransportError> {
        let value = self
            .call(Method::GET, &format!("/channels/{}/pins", channel), None)
            .await?;
        match value {
            Value::Array(items) => items.into_iter().map(message_from).collect(),
            _ => Err(TransportError::Rejected("pins response is not a list".to_string())),
        }
    }
}

#[async_trait]
impl RoleManager for DiscordClient {
    async fn allocate(&self, name: &str, expires_at: DateTime<Utc>) -> Result<RoleId, CollaboratorError> {
        let guild = self.guild()?;
        let value = self
            .call(
                Method::POST,
                &format!("/guilds/{}/roles", guild),
                Some(json!({ "name": name, "mentionable": true })),
            )
            .await
            .map_err(collaborator)?;
        let role: RawRole = serde_json::from_value(value).map_err(|e| CollaboratorError::Failed(e.to_string()))?;
        let id = RoleId(snowflake(&role.id).map_err(collaborator)?);
        tracing::info!("created role '{}' ({}) until {}", name, id, expires_at);
        Ok(id)
    }

    async fn release(&self, role: RoleId) -> Result<(), CollaboratorError> {
        let guild = self.guild()?;
        match self
            .call(Method::DELETE, &format!("/guilds/{}/roles/{}", guild, role), None)
            .await
        {
            Ok(_) | Err(TransportError::NotFound) => {
                tracing::info!("deleted role {}", role);
                Ok(())
            }
            Err(err) => Err(collaborator(err)),
        }
    }
}

#[async_trait]
impl Announcer for DiscordClient {
    async fn announce(&self, event: &ScheduledEvent) -> Result<Option<MessageId>, CollaboratorError> {
        let Some(channel) = self.announce_channel else {
            tracing::debug!("no announcement channel configured, skipping event {}", event.id);
            return Ok(None);
        };
        let id = self
            .send_message(channel, &announcement_text(event))
            .await
            .map_err(collaborator)?;
        Ok(Some(id))
    }
}

#[async_trait]
impl IdentityResolver for DiscordClient {
    async fn resolve(&self, display_name: &str) -> Option<String> {
        let guild = self.guild_id?;
        let path = format!(
            "/guilds/{}/members/search?query={}&limit={}",
            guild,
            encode_query(display_name),
            MEMBER_SEARCH_LIMIT
        );
        let value = match self.call(Method::GET, &path, None).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("member search for '{}' failed: {}", display_name, err);
                return None;
            }
        };
        let members: Vec<RawMember> = serde_json::from_value(value).ok()?;
        matching_member(&members, display_name)
    }
}

/// Percent-encode a query parameter value.
fn encode_query(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}
