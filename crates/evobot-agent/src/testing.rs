// ABOUTME: Test doubles for evobot-agent: a scripted synthesizer and recording role/announcement collaborators.
// ABOUTME: Used by unit tests here and by the workspace integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evobot_core::{DraftFields, MessageId, RoleId, ScheduledEvent};
use ulid::Ulid;

use crate::collab::{Announcer, CollaboratorError, RoleManager};
use crate::synthesis::{SynthesisError, Synthesizer};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A synthesizer that returns fixed fields, with optionally queued failures.
#[derive(Debug, Default)]
pub struct StubSynthesizer {
    fields: DraftFields,
    failures: Mutex<VecDeque<String>>,
    transcripts: Mutex<Vec<Vec<String>>>,
}

impl StubSynthesizer {
    pub fn new(fields: DraftFields) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Make the next call fail with a provider error.
    pub fn fail_next(&self, message: &str) {
        lock(&self.failures).push_back(message.to_string());
    }

    /// Every transcript received so far.
    pub fn transcripts(&self) -> Vec<Vec<String>> {
        lock(&self.transcripts).clone()
    }
}

#[async_trait]
impl Synthesizer for StubSynthesizer {
    async fn synthesize(&self, transcript: &[String]) -> Result<DraftFields, SynthesisError> {
        lock(&self.transcripts).push(transcript.to_vec());
        if let Some(message) = lock(&self.failures).pop_front() {
            return Err(SynthesisError::Provider(message));
        }
        Ok(self.fields.clone())
    }

    fn provider_name(&self) -> &str {
        "stub"
    }
}

/// Role manager that hands out sequential ids and remembers what it did.
#[derive(Debug, Default)]
pub struct RecordingRoles {
    next: AtomicU64,
    allocated: Mutex<Vec<(String, DateTime<Utc>, RoleId)>>,
    released: Mutex<Vec<RoleId>>,
    fail_allocate: AtomicBool,
    fail_release: AtomicBool,
}

impl RecordingRoles {
    pub fn allocated(&self) -> Vec<(String, DateTime<Utc>, RoleId)> {
        lock(&self.allocated).clone()
    }

    pub fn released(&self) -> Vec<RoleId> {
        lock(&self.released).clone()
    }

    pub fn fail_next_allocation(&self) {
        self.fail_allocate.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_release(&self) {
        self.fail_release.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoleManager for RecordingRoles {
    async fn allocate(&self, name: &str, expires_at: DateTime<Utc>) -> Result<RoleId, CollaboratorError> {
        if self.fail_allocate.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::Failed("role creation refused".to_string()));
        }
        let role = RoleId(9_000 + self.next.fetch_add(1, Ordering::SeqCst));
        lock(&self.allocated).push((name.to_string(), expires_at, role));
        Ok(role)
    }

    async fn release(&self, role: RoleId) -> Result<(), CollaboratorError> {
        if self.fail_release.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::RateLimited);
        }
        lock(&self.released).push(role);
        Ok(())
    }
}

/// Announcer that records which events were announced.
#[derive(Debug, Default)]
pub struct RecordingAnnouncer {
    announced: Mutex<Vec<Ulid>>,
    failing: AtomicBool,
}

impl RecordingAnnouncer {
    pub fn announced(&self) -> Vec<Ulid> {
        lock(&self.announced).clone()
    }

    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
    async fn announce(&self, event: &ScheduledEvent) -> Result<Option<MessageId>, CollaboratorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Failed("announcement channel missing".to_string()));
        }
        let mut announced = lock(&self.announced);
        announced.push(event.id);
        Ok(Some(MessageId(50_000 + announced.len() as u64)))
    }
}
