// ABOUTME: Per-user conversation state machine that collects event details over several messages.
// ABOUTME: Summarizes the transcript through a Synthesizer and commits confirmed drafts through EventLifecycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use evobot_core::{
    Clock, ConversationSession, DraftError, DraftFields, DraftRules, EventDraft, EventTransitionError, ScheduledEvent,
    SessionStatus, TransitionError, UserId,
};
use evobot_core::event::parse_datetime;
use evobot_store::{LeaderGuard, Store, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;

use crate::collab::CollaboratorError;
use crate::lifecycle::{EventLifecycle, LifecycleError};
use crate::synthesis::{SynthesisError, Synthesizer, date_in_transcript};

/// Store key holding every user's session.
pub const CONVERSATIONS_KEY: &str = "conversations";

/// Accepted in addition to the configured termination token.
const ALTERNATE_TOKEN: &str = "done";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("a conversation is already in progress")]
    AlreadyInProgress,

    #[error("the conversation expired after inactivity")]
    SessionExpired,

    #[error("no conversation in progress")]
    NoSession,

    #[error("still summarizing the previous messages")]
    Busy,

    #[error("the event is already being confirmed")]
    Confirming,

    #[error("a draft is waiting for confirmation")]
    AwaitingConfirmation,

    #[error("there is no draft to confirm")]
    NotAwaitingConfirmation,

    #[error("nothing was collected before the termination message")]
    EmptyTranscript,

    #[error("could not summarize the conversation: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("the drafted event is invalid: {0}")]
    InvalidDraft(#[from] DraftError),

    #[error("could not confirm as leader")]
    NotLeader,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    EventState(#[from] EventTransitionError),
}

impl From<LifecycleError> for FlowError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotLeader => Self::NotLeader,
            LifecycleError::Store(e) => Self::Store(e),
            LifecycleError::Collaborator(e) => Self::Collaborator(e),
            LifecycleError::Transition(e) => Self::EventState(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowOptions {
    /// Sessions idle longer than this expire.
    pub inactivity_timeout: Duration,
    /// A message starting with this (case-insensitive) ends collection.
    pub termination_token: String,
    pub draft_rules: DraftRules,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::minutes(15),
            termination_token: "terminé".to_string(),
            draft_rules: DraftRules::default(),
        }
    }
}

/// What a submitted message led to.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowReply {
    Started,
    Recorded { step: u32 },
    DraftReady(EventDraft),
}

/// What `recover` found in the persisted sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub restored: usize,
    pub expired: usize,
    pub reopened: usize,
}

type Sessions = BTreeMap<UserId, ConversationSession>;

pub struct ConversationFlow {
    store: Store,
    leader: Arc<LeaderGuard>,
    synthesizer: Arc<dyn Synthesizer>,
    lifecycle: Arc<EventLifecycle>,
    clock: Arc<dyn Clock>,
    options: FlowOptions,
    sessions: Mutex<Sessions>,
    /// Users whose draft is being committed. Only touched while `sessions`
    /// is held.
    confirming: SyncMutex<BTreeSet<UserId>>,
}

impl ConversationFlow {
    pub fn new(
        store: Store,
        leader: Arc<LeaderGuard>,
        synthesizer: Arc<dyn Synthesizer>,
        lifecycle: Arc<EventLifecycle>,
        clock: Arc<dyn Clock>,
        options: FlowOptions,
    ) -> Self {
        Self {
            store,
            leader,
            synthesizer,
            lifecycle,
            clock,
            options,
            sessions: Mutex::new(Sessions::new()),
            confirming: SyncMutex::new(BTreeSet::new()),
        }
    }

    pub async fn start(&self, user: UserId) -> Result<FlowReply, FlowError> {
        let mut sessions = self.sessions.lock().await;
        let now = self.clock.now();

        if let Some(session) = sessions.get_mut(&user)
            && session.status.is_in_progress()
            && !self.expire_if_idle(session, now)
        {
            return Err(FlowError::AlreadyInProgress);
        }

        sessions.insert(user, ConversationSession::start(user, now));
        self.persist(&sessions).await?;
        tracing::info!("conversation started for user {}", user);
        Ok(FlowReply::Started)
    }

    pub async fn submit(&self, user: UserId, message: &str) -> Result<FlowReply, FlowError> {
        let mut sessions = self.sessions.lock().await;
        let now = self.clock.now();
        let remainder = self.strip_termination(message);

        let status = sessions
            .get_mut(&user)
            .and_then(|session| (!self.expire_if_idle(session, now)).then_some(session.status));

        match status {
            Some(SessionStatus::Summarizing) => Err(FlowError::Busy),
            Some(SessionStatus::Committing) => Err(FlowError::AwaitingConfirmation),
            Some(SessionStatus::Active) => match remainder {
                None => {
                    let step = self.record(&mut sessions, user, message, now)?;
                    self.persist(&sessions).await?;
                    Ok(FlowReply::Recorded { step })
                }
                Some(rest) => {
                    if !rest.is_empty() {
                        self.record(&mut sessions, user, &rest, now)?;
                    }
                    self.summarize(sessions, user).await
                }
            },
            // No session, a finished one, or one that just expired: start over.
            _ => {
                let mut session = ConversationSession::start(user, now);
                let reply = match remainder {
                    Some(_) => FlowReply::Started,
                    None => {
                        session.record(message, now)?;
                        FlowReply::Recorded {
                            step: session.step_index,
                        }
                    }
                };
                sessions.insert(user, session);
                self.persist(&sessions).await?;
                tracing::info!("conversation started for user {}", user);
                Ok(reply)
            }
        }
    }

    fn record(&self, sessions: &mut Sessions, user: UserId, message: &str, now: DateTime<Utc>) -> Result<u32, FlowError> {
        let session = sessions.get_mut(&user).ok_or(FlowError::NoSession)?;
        session.record(message, now)?;
        Ok(session.step_index)
    }

    /// Summarize `user`'s transcript. The session lock is released while the
    /// synthesizer runs; the session sits in Summarizing meanwhile.
    async fn summarize(&self, mut sessions: MutexGuard<'_, Sessions>, user: UserId) -> Result<FlowReply, FlowError> {
        let now = self.clock.now();
        let session = sessions.get_mut(&user).ok_or(FlowError::NoSession)?;
        if session.collected.is_empty() {
            return Err(FlowError::EmptyTranscript);
        }
        session.transition(SessionStatus::Summarizing, now)?;
        let transcript = session.collected.clone();
        let started_at = session.started_at;
        if let Err(err) = self.persist(&sessions).await {
            if let Some(session) = sessions.get_mut(&user) {
                session.transition(SessionStatus::Active, now)?;
            }
            return Err(err.into());
        }
        drop(sessions);

        tracing::debug!(
            "summarizing {} message(s) for user {} via {}",
            transcript.len(),
            user,
            self.synthesizer.provider_name()
        );
        let outcome = match self.synthesizer.synthesize(&transcript).await {
            Ok(fields) => self.draft_from(&fields, &transcript).map_err(FlowError::from),
            Err(err) => Err(FlowError::from(err)),
        };

        let mut sessions = self.sessions.lock().await;
        let now = self.clock.now();
        let session = sessions
            .get_mut(&user)
            .filter(|s| s.started_at == started_at && s.status == SessionStatus::Summarizing)
            .ok_or(FlowError::NoSession)?;

        match outcome {
            Ok(draft) => {
                session.draft = Some(draft.clone());
                session.transition(SessionStatus::Committing, now)?;
                self.persist(&sessions).await?;
                tracing::info!("draft '{}' ready for user {}", draft.title, user);
                Ok(FlowReply::DraftReady(draft))
            }
            Err(err) => {
                session.transition(SessionStatus::Active, now)?;
                self.persist(&sessions).await?;
                tracing::warn!("summary for user {} failed: {}", user, err);
                Err(err)
            }
        }
    }

    /// Validate synthesized fields. A start that is too soon is replaced by
    /// a date written in the transcript, if there is one, keeping the
    /// synthesized duration.
    fn draft_from(&self, fields: &DraftFields, transcript: &[String]) -> Result<EventDraft, DraftError> {
        let rules = &self.options.draft_rules;
        let now = self.clock.now();

        match EventDraft::from_fields(fields, now, rules) {
            Err(DraftError::TooSoon { minutes }) => {
                let alt = date_in_transcript(transcript, rules.local_offset)
                    .filter(|alt| *alt >= now + rules.min_lead)
                    .ok_or(DraftError::TooSoon { minutes })?;
                let parse = |raw: &Option<String>| raw.as_deref().and_then(|r| parse_datetime(r, rules.local_offset));
                let length = match (parse(&fields.start_time), parse(&fields.end_time)) {
                    (Some(start), Some(end)) if end > start => end - start,
                    _ => Duration::hours(1),
                };

                let mut adjusted = fields.clone();
                adjusted.start_time = Some(alt.to_rfc3339());
                adjusted.end_time = Some((alt + length).to_rfc3339());
                EventDraft::from_fields(&adjusted, now, rules)
            }
            other => other,
        }
    }

    /// Commit the pending draft as a scheduled event. Only the leader may
    /// confirm; on any failure the draft stays pending. Other users are not
    /// blocked while the event is committed.
    pub async fn confirm(&self, user: UserId) -> Result<ScheduledEvent, FlowError> {
        let mut sessions = self.sessions.lock().await;
        let now = self.clock.now();
        if self.is_confirming(user) {
            return Err(FlowError::Confirming);
        }
        let session = sessions.get_mut(&user).ok_or(FlowError::NoSession)?;

        if self.expire_if_idle(session, now) {
            self.persist(&sessions).await?;
            return Err(FlowError::SessionExpired);
        }
        match session.status {
            SessionStatus::Expired => return Err(FlowError::SessionExpired),
            SessionStatus::Committing => {}
            _ => return Err(FlowError::NotAwaitingConfirmation),
        }
        let draft = session.draft.clone().ok_or(FlowError::NotAwaitingConfirmation)?;
        let started_at = session.started_at;

        if self.leader.ensure_leader().is_err() {
            tracing::warn!("user {} tried to confirm while this instance is not the leader", user);
            return Err(FlowError::NotLeader);
        }

        self.confirming_set().insert(user);
        drop(sessions);
        let outcome = self.lifecycle.commit(&draft, user).await;

        let mut sessions = self.sessions.lock().await;
        self.confirming_set().remove(&user);
        let event = outcome?;

        let now = self.clock.now();
        let session = sessions
            .get_mut(&user)
            .filter(|s| s.started_at == started_at)
            .ok_or(FlowError::NoSession)?;
        session.event_id = Some(event.id);
        session.transition(SessionStatus::Closed, now)?;
        self.persist(&sessions).await?;
        tracing::info!("user {} confirmed event {}", user, event.id);
        Ok(event)
    }

    pub async fn cancel(&self, user: UserId) -> Result<(), FlowError> {
        let mut sessions = self.sessions.lock().await;
        let now = self.clock.now();
        if self.is_confirming(user) {
            return Err(FlowError::Confirming);
        }
        let session = sessions.get_mut(&user).ok_or(FlowError::NoSession)?;

        if self.expire_if_idle(session, now) {
            self.persist(&sessions).await?;
            return Err(FlowError::SessionExpired);
        }
        match session.status {
            SessionStatus::Active | SessionStatus::Committing => {
                session.transition(SessionStatus::Cancelled, now)?;
                session.draft = None;
            }
            SessionStatus::Summarizing => return Err(FlowError::Busy),
            SessionStatus::Expired => return Err(FlowError::SessionExpired),
            SessionStatus::Closed | SessionStatus::Cancelled => return Err(FlowError::NoSession),
        }

        self.persist(&sessions).await?;
        tracing::info!("conversation cancelled by user {}", user);
        Ok(())
    }

    /// The user's current session. An in-progress session past the
    /// inactivity timeout is reported as Expired.
    pub async fn session(&self, user: UserId) -> Option<ConversationSession> {
        let sessions = self.sessions.lock().await;
        let mut session = sessions.get(&user)?.clone();
        if session.is_idle(self.clock.now(), self.options.inactivity_timeout) {
            session.status = SessionStatus::Expired;
        }
        Some(session)
    }

    pub async fn status(&self, user: UserId) -> Option<SessionStatus> {
        self.session(user).await.map(|s| s.status)
    }

    /// Load persisted sessions after a restart. Idle sessions expire and
    /// sessions caught mid-summary resume collecting.
    pub async fn recover(&self) -> Result<RecoveryReport, FlowError> {
        let mut loaded: Sessions = self.store.get_opt(CONVERSATIONS_KEY).await?.unwrap_or_default();
        let now = self.clock.now();
        let mut report = RecoveryReport {
            restored: loaded.len(),
            ..RecoveryReport::default()
        };

        for session in loaded.values_mut() {
            if self.expire_if_idle(session, now) {
                report.expired += 1;
            } else if session.reopen_after_recovery(now) {
                report.reopened += 1;
            }
        }

        let mut sessions = self.sessions.lock().await;
        *sessions = loaded;
        if report.expired + report.reopened > 0 {
            self.persist(&sessions).await?;
        }
        tracing::info!(
            "recovered {} conversation(s): {} expired, {} reopened",
            report.restored,
            report.expired,
            report.reopened
        );
        Ok(report)
    }

    /// Expire every idle in-progress session. Returns how many expired.
    pub async fn expire_idle(&self) -> Result<usize, FlowError> {
        let mut sessions = self.sessions.lock().await;
        let now = self.clock.now();
        let expired = sessions
            .values_mut()
            .map(|session| self.expire_if_idle(session, now))
            .filter(|expired| *expired)
            .count();

        if expired > 0 {
            self.persist(&sessions).await?;
            tracing::info!("expired {} idle conversation(s)", expired);
        }
        Ok(expired)
    }

    /// Run `expire_idle` every `interval` while leading, until `shutdown`
    /// flips to true.
    pub fn spawn_expiry(self: Arc<Self>, interval: StdDuration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.leader.is_leader()
                    && let Err(err) = self.expire_idle().await
                {
                    tracing::error!("conversation expiry failed: {}", err);
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

    fn confirming_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<UserId>> {
        self.confirming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_confirming(&self, user: UserId) -> bool {
        self.confirming_set().contains(&user)
    }

    fn expire_if_idle(&self, session: &mut ConversationSession, now: DateTime<Utc>) -> bool {
        if !session.is_idle(now, self.options.inactivity_timeout) || self.is_confirming(session.user_id) {
            return false;
        }
        match session.transition(SessionStatus::Expired, now) {
            Ok(()) => {
                session.draft = None;
                tracing::debug!("conversation for user {} expired", session.user_id);
                true
            }
            Err(_) => false,
        }
    }

    /// Text after the termination token, or `None` if `message` does not
    /// start with one.
    fn strip_termination(&self, message: &str) -> Option<String> {
        let trimmed = message.trim();
        let lowered = trimmed.to_lowercase();
        [self.options.termination_token.as_str(), ALTERNATE_TOKEN]
            .iter()
            .map(|token| token.to_lowercase())
            .find(|token| !token.is_empty() && lowered.starts_with(token.as_str()))
            .map(|token| {
                trimmed
                    .chars()
                    .skip(token.chars().count())
                    .collect::<String>()
                    .trim_start_matches([' ', ',', '.', '!', ':'])
                    .trim()
                    .to_string()
            })
    }

    /// Write every session. Followers keep their sessions in memory only, so
    /// they never overwrite what the leader has stored.
    async fn persist(&self, sessions: &Sessions) -> Result<(), StoreError> {
        if !self.leader.is_leader() {
            tracing::debug!("not leading, conversations kept in memory only");
            return Ok(());
        }
        self.store.put(CONVERSATIONS_KEY, sessions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::RoleManager;
    use crate::testing::{RecordingAnnouncer, RecordingRoles, StubSynthesizer};
    use async_trait::async_trait;
    use evobot_core::{ChannelId, EventState, ManualClock, RoleId};
    use evobot_store::testing::MemoryTransport;
    use evobot_store::{ChannelStore, ChannelStoreOptions, LeaderOptions, TransportError};
    use tokio::sync::Notify;

    const USER: UserId = UserId(42);

    struct Harness {
        clock: Arc<ManualClock>,
        transport: Arc<MemoryTransport>,
        store: Store,
        leader: Arc<LeaderGuard>,
        synthesizer: Arc<StubSynthesizer>,
        roles: Arc<RecordingRoles>,
        lifecycle: Arc<EventLifecycle>,
        flow: ConversationFlow,
    }

    fn fields(start: &str) -> DraftFields {
        DraftFields {
            name: Some("Castle raid".to_string()),
            description: Some("Bring potions".to_string()),
            start_time: Some(start.to_string()),
            end_time: None,
            location: Some("Castle".to_string()),
            max_slots: Some(20),
        }
    }

    async fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let start = (clock.now() + Duration::days(2)).to_rfc3339();
        harness_with(clock, fields(&start)).await
    }

    async fn harness_with(clock: Arc<ManualClock>, draft_fields: DraftFields) -> Harness {
        let transport = Arc::new(MemoryTransport::new());
        let store = Store::new(Arc::new(ChannelStore::new(
            transport.clone(),
            ChannelId(1),
            ChannelStoreOptions::default(),
        )));
        let leader = Arc::new(LeaderGuard::new(
            store.clone(),
            "instance-a",
            LeaderOptions {
                ttl: Duration::days(30),
                max_renew_failures: 3,
            },
            clock.clone(),
        ));
        assert!(leader.acquire().await.unwrap());

        let synthesizer = Arc::new(StubSynthesizer::new(draft_fields));
        let roles = Arc::new(RecordingRoles::default());
        let lifecycle = Arc::new(EventLifecycle::new(
            store.clone(),
            leader.clone(),
            roles.clone(),
            Arc::new(RecordingAnnouncer::default()),
            clock.clone(),
            "Event participants",
        ));
        let flow = ConversationFlow::new(
            store.clone(),
            leader.clone(),
            synthesizer.clone(),
            lifecycle.clone(),
            clock.clone(),
            FlowOptions::default(),
        );
        Harness {
            clock,
            transport,
            store,
            leader,
            synthesizer,
            roles,
            lifecycle,
            flow,
        }
    }

    impl Harness {
        fn fresh_flow(&self) -> ConversationFlow {
            ConversationFlow::new(
                self.store.clone(),
                self.leader.clone(),
                self.synthesizer.clone(),
                self.lifecycle.clone(),
                self.clock.clone(),
                FlowOptions::default(),
            )
        }

        /// A flow sharing this store and clock whose events go through `roles`.
        fn flow_with_roles(&self, roles: Arc<dyn RoleManager>) -> ConversationFlow {
            let lifecycle = Arc::new(EventLifecycle::new(
                self.store.clone(),
                self.leader.clone(),
                roles,
                Arc::new(RecordingAnnouncer::default()),
                self.clock.clone(),
                "Event participants",
            ));
            ConversationFlow::new(
                self.store.clone(),
                self.leader.clone(),
                self.synthesizer.clone(),
                lifecycle,
                self.clock.clone(),
                FlowOptions::default(),
            )
        }
    }

    /// Role manager that holds each allocation until `open` is called.
    #[derive(Default)]
    struct GatedRoles {
        inner: RecordingRoles,
        entered: Notify,
        gate: Notify,
    }

    impl GatedRoles {
        fn open(&self) {
            self.gate.notify_one();
        }
    }

    #[async_trait]
    impl RoleManager for GatedRoles {
        async fn allocate(&self, name: &str, expires_at: DateTime<Utc>) -> Result<RoleId, CollaboratorError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.allocate(name, expires_at).await
        }

        async fn release(&self, role: RoleId) -> Result<(), CollaboratorError> {
            self.inner.release(role).await
        }
    }

    #[tokio::test]
    async fn full_conversation_commits_one_event() {
        let h = harness().await;

        assert_eq!(h.flow.start(USER).await.unwrap(), FlowReply::Started);
        for (i, msg) in ["castle raid", "in two days", "twenty people"].iter().enumerate() {
            assert_eq!(
                h.flow.submit(USER, msg).await.unwrap(),
                FlowReply::Recorded { step: i as u32 + 1 }
            );
        }

        let reply = h.flow.submit(USER, "Terminé").await.unwrap();
        let FlowReply::DraftReady(draft) = reply else {
            panic!("expected a draft, got {reply:?}");
        };
        assert_eq!(draft.title, "Castle raid");
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Committing));
        assert_eq!(h.synthesizer.transcripts()[0].len(), 3);

        let event = h.flow.confirm(USER).await.unwrap();
        assert_eq!(event.state, EventState::Confirmed);
        assert_eq!(h.roles.allocated().len(), 1);

        let session = h.flow.session(USER).await.unwrap();
        assert_eq!(session.status, SessionStatus::Closed);
        assert_eq!(session.event_id, Some(event.id));
        assert_eq!(h.lifecycle.events().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idle_session_expires_without_a_record() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();

        h.clock.advance(Duration::minutes(16));
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Expired));
        assert_eq!(h.flow.expire_idle().await.unwrap(), 1);
        assert!(matches!(h.flow.confirm(USER).await, Err(FlowError::SessionExpired)));
        assert!(h.lifecycle.events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirm_and_cancel_on_expired_session_fail() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.flow.submit(USER, "terminé").await.unwrap();

        h.clock.advance(Duration::minutes(20));
        assert!(matches!(h.flow.confirm(USER).await, Err(FlowError::SessionExpired)));
        assert!(matches!(h.flow.cancel(USER).await, Err(FlowError::SessionExpired)));
        assert!(h.roles.allocated().is_empty());
    }

    #[tokio::test]
    async fn submit_after_expiry_starts_fresh() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "old idea").await.unwrap();
        h.clock.advance(Duration::minutes(30));

        assert_eq!(
            h.flow.submit(USER, "new idea").await.unwrap(),
            FlowReply::Recorded { step: 1 }
        );
        let session = h.flow.session(USER).await.unwrap();
        assert_eq!(session.collected, vec!["new idea".to_string()]);
    }

    #[tokio::test]
    async fn submit_without_session_starts_one() {
        let h = harness().await;
        assert_eq!(
            h.flow.submit(USER, "raid saturday").await.unwrap(),
            FlowReply::Recorded { step: 1 }
        );
        assert_eq!(h.flow.submit(UserId(5), "done").await.unwrap(), FlowReply::Started);
        assert!(h.flow.session(UserId(5)).await.unwrap().collected.is_empty());
    }

    #[tokio::test]
    async fn users_progress_independently() {
        let h = harness().await;
        let submits = (1..=5u64).map(|n| h.flow.submit(UserId(n), "raid on saturday"));
        for reply in futures::future::join_all(submits).await {
            assert_eq!(reply.unwrap(), FlowReply::Recorded { step: 1 });
        }

        let restarted = h.fresh_flow();
        assert_eq!(restarted.recover().await.unwrap().restored, 5);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        assert!(matches!(h.flow.start(USER).await, Err(FlowError::AlreadyInProgress)));

        h.clock.advance(Duration::minutes(16));
        assert_eq!(h.flow.start(USER).await.unwrap(), FlowReply::Started);
    }

    #[tokio::test]
    async fn synthesis_failure_returns_to_active() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.synthesizer.fail_next("model overloaded");

        assert!(matches!(h.flow.submit(USER, "terminé").await, Err(FlowError::Synthesis(_))));
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Active));

        h.flow.submit(USER, "saturday evening").await.unwrap();
        assert!(matches!(h.flow.submit(USER, "done").await.unwrap(), FlowReply::DraftReady(_)));
    }

    #[tokio::test]
    async fn failed_summary_write_leaves_session_active() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.transport.fail_next([TransportError::Rejected("missing permissions".to_string())]);

        assert!(matches!(h.flow.submit(USER, "terminé").await, Err(FlowError::Store(_))));
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Active));
        assert!(h.synthesizer.transcripts().is_empty());

        assert!(matches!(h.flow.submit(USER, "terminé").await.unwrap(), FlowReply::DraftReady(_)));
    }

    #[tokio::test]
    async fn termination_text_after_token_is_kept() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.flow.submit(USER, "Terminé, bring potions").await.unwrap();

        assert_eq!(
            h.synthesizer.transcripts()[0],
            vec!["castle raid".to_string(), "bring potions".to_string()]
        );
    }

    #[tokio::test]
    async fn termination_with_nothing_collected_is_rejected() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        assert!(matches!(h.flow.submit(USER, "terminé").await, Err(FlowError::EmptyTranscript)));
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Active));
    }

    #[tokio::test]
    async fn invalid_draft_returns_to_active() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let h = harness_with(clock, fields("not a date")).await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();

        assert!(matches!(
            h.flow.submit(USER, "terminé").await,
            Err(FlowError::InvalidDraft(DraftError::UnparsableDate(_)))
        ));
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Active));
    }

    #[tokio::test]
    async fn too_soon_start_falls_back_to_transcript_date() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let soon = (clock.now() + Duration::minutes(1)).to_rfc3339();
        let h = harness_with(clock, fields(&soon)).await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "raid on 14/08/2099 20:30").await.unwrap();

        let FlowReply::DraftReady(draft) = h.flow.submit(USER, "terminé").await.unwrap() else {
            panic!("expected a draft");
        };
        assert_eq!(draft.window.start.to_rfc3339(), "2099-08-14T20:30:00+00:00");
        assert_eq!(draft.window.end - draft.window.start, Duration::hours(1));
    }

    #[tokio::test]
    async fn messages_while_awaiting_confirmation_are_refused() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.flow.submit(USER, "terminé").await.unwrap();

        assert!(matches!(
            h.flow.submit(USER, "one more thing").await,
            Err(FlowError::AwaitingConfirmation)
        ));
    }

    #[tokio::test]
    async fn cancel_discards_the_draft() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.flow.submit(USER, "terminé").await.unwrap();

        h.flow.cancel(USER).await.unwrap();
        let session = h.flow.session(USER).await.unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert!(session.draft.is_none());
        assert!(matches!(h.flow.confirm(USER).await, Err(FlowError::NotAwaitingConfirmation)));
        assert!(matches!(h.flow.cancel(USER).await, Err(FlowError::NoSession)));
    }

    #[tokio::test]
    async fn follower_cannot_confirm() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.flow.submit(USER, "terminé").await.unwrap();
        h.leader.release().await.unwrap();

        let err = h.flow.confirm(USER).await.unwrap_err();
        assert!(matches!(err, FlowError::NotLeader));
        assert_eq!(err.to_string(), "could not confirm as leader");
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Committing));
    }

    #[tokio::test]
    async fn follower_does_not_overwrite_leader_sessions() {
        let h = harness().await;
        let follower_guard = Arc::new(LeaderGuard::new(
            h.store.clone(),
            "instance-b",
            LeaderOptions {
                ttl: Duration::days(30),
                max_renew_failures: 3,
            },
            h.clock.clone(),
        ));
        assert!(!follower_guard.acquire().await.unwrap());
        let follower = ConversationFlow::new(
            h.store.clone(),
            follower_guard,
            h.synthesizer.clone(),
            h.lifecycle.clone(),
            h.clock.clone(),
            FlowOptions::default(),
        );

        h.flow.submit(USER, "castle raid").await.unwrap();
        follower.submit(UserId(8), "stale message").await.unwrap();
        h.flow.submit(USER, "saturday").await.unwrap();
        follower.submit(UserId(8), "another one").await.unwrap();

        let stored: Sessions = h.store.get(CONVERSATIONS_KEY).await.unwrap();
        assert_eq!(stored.keys().copied().collect::<Vec<_>>(), vec![USER]);
        assert_eq!(stored[&USER].collected.len(), 2);
    }

    #[tokio::test]
    async fn confirm_does_not_block_other_users() {
        let h = harness().await;
        let roles = Arc::new(GatedRoles::default());
        let flow = h.flow_with_roles(roles.clone());
        flow.start(USER).await.unwrap();
        flow.submit(USER, "castle raid").await.unwrap();
        flow.submit(USER, "terminé").await.unwrap();

        let others = async {
            roles.entered.notified().await;
            h.clock.advance(Duration::minutes(20));
            assert_eq!(flow.expire_idle().await.unwrap(), 0);
            let reply = flow.submit(UserId(8), "raid on friday").await.unwrap();
            assert_eq!(reply, FlowReply::Recorded { step: 1 });
            assert!(matches!(flow.confirm(USER).await, Err(FlowError::Confirming)));
            assert!(matches!(flow.cancel(USER).await, Err(FlowError::Confirming)));
            roles.open();
        };
        let (confirmed, ()) = tokio::join!(flow.confirm(USER), others);

        let event = confirmed.unwrap();
        assert_eq!(roles.inner.allocated().len(), 1);
        let session = flow.session(USER).await.unwrap();
        assert_eq!(session.event_id, Some(event.id));
        assert_eq!(session.status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn sessions_survive_restart() {
        let h = harness().await;
        h.flow.start(USER).await.unwrap();
        h.flow.submit(USER, "castle raid").await.unwrap();
        h.flow.start(UserId(8)).await.unwrap();

        let restarted = h.fresh_flow();
        let report = restarted.recover().await.unwrap();
        assert_eq!(report.restored, 2);
        assert_eq!(report.expired, 0);

        let session = restarted.session(USER).await.unwrap();
        assert_eq!(session.collected, vec!["castle raid".to_string()]);
        assert_eq!(
            restarted.submit(USER, "saturday").await.unwrap(),
            FlowReply::Recorded { step: 2 }
        );
    }

    #[tokio::test]
    async fn recovery_expires_idle_and_reopens_summarizing() {
        let h = harness().await;
        let now = h.clock.now();

        let mut summarizing = ConversationSession::start(USER, now);
        summarizing.record("castle raid", now).unwrap();
        summarizing.transition(SessionStatus::Summarizing, now).unwrap();
        let mut stale = ConversationSession::start(UserId(8), now - Duration::hours(1));
        stale.record("old", now - Duration::hours(1)).unwrap();

        let mut persisted = Sessions::new();
        persisted.insert(USER, summarizing);
        persisted.insert(UserId(8), stale);
        h.store.put(CONVERSATIONS_KEY, &persisted).await.unwrap();

        let report = h.flow.recover().await.unwrap();
        assert_eq!(report, RecoveryReport { restored: 2, expired: 1, reopened: 1 });
        assert_eq!(h.flow.status(USER).await, Some(SessionStatus::Active));
        assert_eq!(h.flow.status(UserId(8)).await, Some(SessionStatus::Expired));
    }
}
