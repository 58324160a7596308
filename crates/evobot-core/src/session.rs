// ABOUTME: Per-user conversation session record and its status state machine.
// ABOUTME: Enforces forward-only transitions, with the two sanctioned re-openings back to Active.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::event::EventDraft;
use crate::ids::UserId;

/// Lifecycle status of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Summarizing,
    Committing,
    Closed,
    Expired,
    Cancelled,
}

impl SessionStatus {
    /// Closed, Expired and Cancelled sessions never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Expired | Self::Cancelled)
    }

    pub fn is_in_progress(self) -> bool {
        !self.is_terminal()
    }

    fn rank(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Summarizing => 1,
            Self::Committing => 2,
            Self::Closed | Self::Expired | Self::Cancelled => 3,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// One user's multi-turn conversation, persisted so it survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub user_id: UserId,
    pub step_index: u32,
    pub collected: Vec<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<EventDraft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Ulid>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn start(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            step_index: 0,
            collected: Vec::new(),
            status: SessionStatus::Active,
            draft: None,
            event_id: None,
            started_at: now,
            last_activity_at: now,
        }
    }

    /// Whether an in-progress session has been idle for longer than `timeout`.
    /// Terminal sessions are never considered idle.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status.is_in_progress() && now - self.last_activity_at > timeout
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    /// Append one collected message and advance the step counter.
    pub fn record(&mut self, message: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != SessionStatus::Active {
            return Err(TransitionError {
                from: self.status,
                to: SessionStatus::Active,
            });
        }
        self.collected.push(message.trim().to_string());
        self.step_index += 1;
        self.touch(now);
        Ok(())
    }

    /// Move to `to`. Transitions only go forward, except Summarizing -> Active
    /// when synthesis fails.
    pub fn transition(&mut self, to: SessionStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let from = self.status;
        let allowed = match (from, to) {
            (SessionStatus::Summarizing, SessionStatus::Active) => true,
            (SessionStatus::Active, SessionStatus::Committing) => false,
            (SessionStatus::Summarizing, SessionStatus::Cancelled) => false,
            (SessionStatus::Active, SessionStatus::Closed) => false,
            (SessionStatus::Summarizing, SessionStatus::Closed) => false,
            _ => from.is_in_progress() && to.rank() > from.rank(),
        };

        if !allowed {
            return Err(TransitionError { from, to });
        }

        self.status = to;
        self.touch(now);
        Ok(())
    }

    /// Re-open a session found mid-summary after a process restart. The
    /// synthesis call that was in flight is lost, so collection resumes.
    pub fn reopen_after_recovery(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != SessionStatus::Summarizing {
            return false;
        }
        self.status = SessionStatus::Active;
        self.touch(now);
        true
    }
}
