// ABOUTME: Commits confirmed drafts as durable scheduled events and drives them through their lifecycle.
// ABOUTME: The reconcile sweep activates, closes, and repairs events, releasing participant roles at close.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use evobot_core::{Clock, EventDraft, EventState, EventTransitionError, RoleId, ScheduledEvent, UserId};
use evobot_store::{LeaderError, LeaderGuard, Store, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::collab::{Announcer, CollaboratorError, RoleManager, participant_role_name};

/// Store key holding every scheduled event.
pub const EVENTS_KEY: &str = "events";

/// Closed events are kept this long after their window ends, then pruned.
const CLOSED_RETENTION_DAYS: i64 = 7;

pub type EventBook = BTreeMap<Ulid, ScheduledEvent>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("not the leader")]
    NotLeader,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Transition(#[from] EventTransitionError),
}

impl From<LeaderError> for LifecycleError {
    fn from(err: LeaderError) -> Self {
        match err {
            LeaderError::Store(e) => Self::Store(e),
            LeaderError::NotLeader | LeaderError::LeaseLost => Self::NotLeader,
        }
    }
}

/// Counts of what one reconcile pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub activated: usize,
    pub closed: usize,
    pub pruned: usize,
}

impl ReconcileReport {
    fn changed(&self) -> bool {
        self.confirmed + self.activated + self.closed + self.pruned > 0
    }
}

pub struct EventLifecycle {
    store: Store,
    leader: Arc<LeaderGuard>,
    roles: Arc<dyn RoleManager>,
    announcer: Arc<dyn Announcer>,
    clock: Arc<dyn Clock>,
    role_prefix: String,
    /// Serializes read-modify-write cycles on the events snapshot.
    book: Mutex<()>,
}

impl EventLifecycle {
    pub fn new(
        store: Store,
        leader: Arc<LeaderGuard>,
        roles: Arc<dyn RoleManager>,
        announcer: Arc<dyn Announcer>,
        clock: Arc<dyn Clock>,
        role_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            leader,
            roles,
            announcer,
            clock,
            role_prefix: role_prefix.into(),
            book: Mutex::new(()),
        }
    }

    pub async fn events(&self) -> Result<EventBook, StoreError> {
        Ok(self.store.get_opt(EVENTS_KEY).await?.unwrap_or_default())
    }

    pub async fn event(&self, id: Ulid) -> Result<Option<ScheduledEvent>, StoreError> {
        Ok(self.events().await?.remove(&id))
    }

    async fn save(&self, book: &EventBook) -> Result<(), StoreError> {
        self.store.put(EVENTS_KEY, book).await
    }

    /// Drop a Draft that will not be confirmed.
    async fn withdraw(&self, book: &mut EventBook, id: Ulid) {
        book.remove(&id);
        if let Err(err) = self.save(book).await {
            tracing::warn!("could not withdraw draft event {}: {}", id, err);
        }
    }

    /// Give back a role that no event ended up holding.
    async fn release_unused(&self, role: RoleId) {
        if let Err(err) = self.roles.release(role).await {
            tracing::warn!("could not release unused role {}: {}", role, err);
        }
    }

    /// Persist `draft` as a Draft event, allocate its participant role,
    /// persist it as Confirmed, then announce it. A crash between the two
    /// writes leaves a Draft that `reconcile` finishes.
    pub async fn commit(&self, draft: &EventDraft, author: UserId) -> Result<ScheduledEvent, LifecycleError> {
        self.leader.ensure_leader()?;
        let _book = self.book.lock().await;
        let mut book = self.events().await?;

        let mut event = ScheduledEvent::from_draft(draft, author, self.clock.now());
        book.insert(event.id, event.clone());
        self.save(&book).await?;

        if let Err(err) = self.leader.ensure_leader() {
            self.withdraw(&mut book, event.id).await;
            return Err(err.into());
        }
        let role_name = participant_role_name(&self.role_prefix, &event.title);
        let role = match self.roles.allocate(&role_name, event.window.end).await {
            Ok(role) => role,
            Err(err) => {
                self.withdraw(&mut book, event.id).await;
                return Err(err.into());
            }
        };

        if let Err(err) = event.confirm(role, self.clock.now()) {
            self.release_unused(role).await;
            self.withdraw(&mut book, event.id).await;
            return Err(err.into());
        }
        book.insert(event.id, event.clone());
        self.save(&book).await?;
        tracing::info!("event {} '{}' confirmed with role {}", event.id, event.title, role);

        if self.leader.is_leader() {
            match self.announcer.announce(&event).await {
                Ok(Some(message)) => {
                    event.announce_message_id = Some(message);
                    book.insert(event.id, event.clone());
                    if let Err(err) = self.save(&book).await {
                        tracing::warn!("could not record announcement for {}: {}", event.id, err);
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::warn!("announcement for event {} failed: {}", event.id, err),
            }
        }

        Ok(event)
    }

    /// Advance every event according to the clock. Does nothing unless this
    /// instance leads. If the lease lapses mid-pass, the pass stops and what
    /// it already did is saved.
    pub async fn reconcile(&self) -> Result<ReconcileReport, LifecycleError> {
        let mut report = ReconcileReport::default();
        if !self.leader.is_leader() {
            return Ok(report);
        }

        let _book = self.book.lock().await;
        let mut book = self.events().await?;
        let now = self.clock.now();
        let mut lost_leadership = false;

        for event in book.values_mut() {
            let ended = event.window.has_ended(now);
            match event.state {
                EventState::Draft if ended => {
                    event.close(now)?;
                    report.closed += 1;
                }
                EventState::Draft => {
                    if !self.leader.is_leader() {
                        lost_leadership = true;
                        break;
                    }
                    let role_name = participant_role_name(&self.role_prefix, &event.title);
                    match self.roles.allocate(&role_name, event.window.end).await {
                        Ok(role) => match event.confirm(role, now) {
                            Ok(()) => {
                                report.confirmed += 1;
                                tracing::info!("repaired interrupted commit of event {}", event.id);
                            }
                            Err(err) => {
                                tracing::warn!("could not confirm event {}: {}", event.id, err);
                                self.release_unused(role).await;
                            }
                        },
                        Err(err) => tracing::warn!("role allocation for event {} failed: {}", event.id, err),
                    }
                }
                EventState::Confirmed | EventState::Active if ended => {
                    if !self.leader.is_leader() {
                        lost_leadership = true;
                        break;
                    }
                    if let Some(role) = event.participant_role_id
                        && let Err(err) = self.roles.release(role).await
                    {
                        tracing::warn!("could not release role {} of event {}: {}", role, event.id, err);
                        continue;
                    }
                    event.close(now)?;
                    report.closed += 1;
                    tracing::info!("event {} '{}' closed", event.id, event.title);
                }
                EventState::Confirmed if event.window.has_started(now) => {
                    event.activate(now)?;
                    report.activated += 1;
                }
                _ => {}
            }
        }

        if lost_leadership {
            tracing::warn!("leadership lost during reconcile, saving partial pass: {:?}", report);
        } else {
            let retention = Duration::days(CLOSED_RETENTION_DAYS);
            let before = book.len();
            book.retain(|_, event| !(event.state == EventState::Closed && now - event.window.end > retention));
            report.pruned = before - book.len();
        }

        if report.changed() {
            self.save(&book).await?;
            tracing::debug!("reconciled events: {:?}", report);
        }
        Ok(report)
    }

    /// Run `reconcile` every `interval` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, interval: StdDuration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.reconcile().await {
                    tracing::error!("event reconcile failed: {}", err);
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
        })
    }
}
