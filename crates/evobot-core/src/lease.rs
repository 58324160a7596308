// ABOUTME: The leader lease record persisted through the active backend.
// ABOUTME: A lease names its holder and is authoritative only until expires_at.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded leadership grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderLease {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaderLease {
    pub fn new(holder_id: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            holder_id: holder_id.into(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    /// A lease expires at `expires_at` exactly; it is not valid at that instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, instance_id: &str) -> bool {
        self.holder_id == instance_id
    }

    /// Same holder and acquisition time, pushed out to `now + ttl`.
    pub fn renewed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            holder_id: self.holder_id.clone(),
            acquired_at: self.acquired_at,
            expires_at: now + ttl,
        }
    }
}
