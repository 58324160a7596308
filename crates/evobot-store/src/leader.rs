// ABOUTME: Lease-based leader guard that gates side-effecting background work to one instance.
// ABOUTME: Acquires through compare-and-swap on the active backend and demotes itself when renewal fails.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use chrono::Duration;
use evobot_core::{Clock, LeaderLease};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::Store;
use crate::error::StoreError;

/// Key the lease is stored under.
pub const LEASE_KEY: &str = "leader/lease";

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("leadership lease lost")]
    LeaseLost,

    #[error("this instance is not the leader")]
    NotLeader,

    #[error("lease store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct LeaderOptions {
    pub ttl: Duration,
    /// Consecutive backend failures during renewal before stepping down.
    pub max_renew_failures: u32,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(60),
            max_renew_failures: 3,
        }
    }
}

#[derive(Debug, Default)]
struct LocalState {
    lease: Option<LeaderLease>,
    failures: u32,
}

/// Best-effort leadership for one bot instance.
///
/// At most one lease value is authoritative in the backend at any time, but
/// an instance that stops renewing keeps believing it leads until its local
/// copy expires. Side effects call [`LeaderGuard::ensure_leader`] right
/// before they happen to keep that window small.
pub struct LeaderGuard {
    store: Store,
    instance_id: String,
    options: LeaderOptions,
    clock: Arc<dyn Clock>,
    state: Mutex<LocalState>,
}

impl LeaderGuard {
    pub fn new(store: Store, instance_id: impl Into<String>, options: LeaderOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            options,
            clock,
            state: Mutex::new(LocalState::default()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True only while this process holds a lease it believes is unexpired.
    pub fn is_leader(&self) -> bool {
        let now = self.clock.now();
        self.state()
            .lease
            .as_ref()
            .is_some_and(|lease| !lease.is_expired(now))
    }

    pub fn ensure_leader(&self) -> Result<(), LeaderError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(LeaderError::NotLeader)
        }
    }

    /// Try to take the lease. Succeeds when no lease exists, the stored one
    /// has expired, or it is already ours.
    pub async fn acquire(&self) -> Result<bool, LeaderError> {
        let now = self.clock.now();
        let current: Option<LeaderLease> = self.store.get_opt(LEASE_KEY).await?;

        let next = match &current {
            Some(lease) if lease.is_held_by(&self.instance_id) => lease.renewed(now, self.options.ttl),
            Some(lease) if !lease.is_expired(now) => {
                tracing::debug!("lease held by {} until {}", lease.holder_id, lease.expires_at);
                self.demote();
                return Ok(false);
            }
            _ => LeaderLease::new(self.instance_id.clone(), now, self.options.ttl),
        };

        if !self.store.compare_and_swap(LEASE_KEY, current.as_ref(), &next).await? {
            tracing::debug!("lost lease race for {}", self.instance_id);
            return Ok(false);
        }

        tracing::info!("{} acquired leadership until {}", self.instance_id, next.expires_at);
        let mut state = self.state();
        state.lease = Some(next);
        state.failures = 0;
        Ok(true)
    }

    /// Extend our lease. Finding it held by someone else, or expired,
    /// demotes immediately; backend failures demote after
    /// `max_renew_failures` in a row.
    pub async fn renew(&self) -> Result<(), LeaderError> {
        let local = self.state().lease.clone().ok_or(LeaderError::NotLeader)?;
        let now = self.clock.now();
        if local.is_expired(now) {
            tracing::warn!("{} let its lease expire", self.instance_id);
            self.demote();
            return Err(LeaderError::LeaseLost);
        }

        let current: Option<LeaderLease> = match self.store.get_opt(LEASE_KEY).await {
            Ok(current) => current,
            Err(err) => return Err(self.renew_failed(err)),
        };

        let stored = match current {
            Some(lease) if lease.is_held_by(&self.instance_id) && !lease.is_expired(now) => lease,
            other => {
                tracing::warn!(
                    "{} lost leadership (lease now {:?})",
                    self.instance_id,
                    other.map(|l| l.holder_id)
                );
                self.demote();
                return Err(LeaderError::LeaseLost);
            }
        };

        let next = stored.renewed(now, self.options.ttl);
        match self.store.compare_and_swap(LEASE_KEY, Some(&stored), &next).await {
            Ok(true) => {
                let mut state = self.state();
                state.lease = Some(next);
                state.failures = 0;
                Ok(())
            }
            Ok(false) => {
                tracing::warn!("{} lease changed underneath renewal", self.instance_id);
                self.demote();
                Err(LeaderError::LeaseLost)
            }
            Err(err) => Err(self.renew_failed(err)),
        }
    }

    /// Give up the lease so another instance can take over without waiting
    /// for it to expire.
    pub async fn release(&self) -> Result<(), LeaderError> {
        let held = self.state().lease.take().is_some();
        if !held {
            return Ok(());
        }

        let current: Option<LeaderLease> = self.store.get_opt(LEASE_KEY).await?;
        if current.is_some_and(|lease| lease.is_held_by(&self.instance_id)) {
            self.store.delete(LEASE_KEY).await?;
            tracing::info!("{} released leadership", self.instance_id);
        }
        Ok(())
    }

    fn demote(&self) {
        let mut state = self.state();
        if state.lease.take().is_some() {
            tracing::info!("{} is no longer the leader", self.instance_id);
        }
        state.failures = 0;
    }

    fn renew_failed(&self, err: StoreError) -> LeaderError {
        let failures = {
            let mut state = self.state();
            state.failures += 1;
            state.failures
        };
        tracing::warn!(
            "lease renewal failed ({}/{}): {}",
            failures,
            self.options.max_renew_failures,
            err
        );
        if failures >= self.options.max_renew_failures {
            self.demote();
            LeaderError::LeaseLost
        } else {
            LeaderError::Store(err)
        }
    }

    /// Renew while leading and try to acquire otherwise, every `interval`,
    /// until `shutdown` flips to true. The lease is released on the way out.
    pub fn spawn(self: Arc<Self>, interval: StdDuration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_leader() {
                    if let Err(err) = self.renew().await {
                        tracing::debug!("renew: {}", err);
                    }
                } else if let Err(err) = self.acquire().await {
                    tracing::warn!("lease acquisition failed: {}", err);
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Err(err) = self.release().await {
                tracing::warn!("failed to release lease: {}", err);
            }
        })
    }
}
