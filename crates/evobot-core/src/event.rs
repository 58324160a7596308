// ABOUTME: Scheduled event records, their Draft -> Confirmed -> Active -> Closed lifecycle, and draft parsing.
// ABOUTME: Turns loosely structured synthesizer output into a validated EventDraft with a time window.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::ids::{MessageId, RoleId, UserId};

const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 1_000;
const DEFAULT_TITLE: &str = "Untitled event";
const DEFAULT_DESCRIPTION: &str = "No description";
const LOCAL_FORMATS: [&str; 3] = ["%d/%m/%Y %H:%M", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"];

/// Errors produced when validating draft fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("the start date is missing")]
    MissingStart,

    #[error("could not understand the date '{0}'")]
    UnparsableDate(String),

    #[error("the end time must be after the start time")]
    EndBeforeStart,

    #[error("the start time must be at least {minutes} minutes in the future")]
    TooSoon { minutes: i64 },
}

/// Raw, unvalidated fields as produced by the synthesis capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftFields {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub max_slots: Option<u32>,
}

/// Rules applied when turning DraftFields into an EventDraft.
#[derive(Debug, Clone, Copy)]
pub struct DraftRules {
    /// Offset used for dates written without one (`DD/MM/YYYY HH:MM`).
    pub local_offset: FixedOffset,
    /// How far in the future an event must start.
    pub min_lead: Duration,
}

impl Default for DraftRules {
    fn default() -> Self {
        Self {
            local_offset: Utc.fix(),
            min_lead: Duration::minutes(5),
        }
    }
}

/// A half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EventWindow {
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }
}

/// A validated event proposal shown to the user before confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub window: EventWindow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slots: Option<u32>,
}

impl EventDraft {
    /// Validate synthesizer output against `rules` at time `now`.
    ///
    /// A missing end defaults to one hour after the start. Title and
    /// description are trimmed to the platform's limits.
    pub fn from_fields(fields: &DraftFields, now: DateTime<Utc>, rules: &DraftRules) -> Result<Self, DraftError> {
        let start = match non_blank(&fields.start_time) {
            Some(raw) => parse_datetime(raw, rules.local_offset)
                .ok_or_else(|| DraftError::UnparsableDate(raw.to_string()))?,
            None => return Err(DraftError::MissingStart),
        };

        let end = match non_blank(&fields.end_time) {
            Some(raw) => parse_datetime(raw, rules.local_offset)
                .ok_or_else(|| DraftError::UnparsableDate(raw.to_string()))?,
            None => start + Duration::hours(1),
        };

        if end <= start {
            return Err(DraftError::EndBeforeStart);
        }

        if start < now + rules.min_lead {
            return Err(DraftError::TooSoon {
                minutes: rules.min_lead.num_minutes(),
            });
        }

        Ok(Self {
            title: truncate_chars(non_blank(&fields.name).unwrap_or(DEFAULT_TITLE), MAX_TITLE_CHARS),
            description: truncate_chars(
                non_blank(&fields.description).unwrap_or(DEFAULT_DESCRIPTION),
                MAX_DESCRIPTION_CHARS,
            ),
            window: EventWindow { start, end },
            location: non_blank(&fields.location).map(str::to_string),
            max_slots: fields.max_slots,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Parse an RFC 3339 timestamp, or a local date in one of the accepted
/// formats interpreted at `offset`.
pub fn parse_datetime(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    LOCAL_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .and_then(|naive| offset.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Lifecycle of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Draft,
    Confirmed,
    Active,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid event transition: {from:?} -> {to:?}")]
pub struct EventTransitionError {
    pub from: EventState,
    pub to: EventState,
}

/// A durable scheduled event. The participant role exists only between
/// Confirmed and Closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub window: EventWindow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slots: Option<u32>,
    pub author_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_role_id: Option<RoleId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce_message_id: Option<MessageId>,
    pub state: EventState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledEvent {
    pub fn from_draft(draft: &EventDraft, author_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            window: draft.window,
            location: draft.location.clone(),
            max_slots: draft.max_slots,
            author_id,
            participant_role_id: None,
            announce_message_id: None,
            state: EventState::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Draft -> Confirmed, recording the freshly allocated participant role.
    pub fn confirm(&mut self, role: RoleId, now: DateTime<Utc>) -> Result<(), EventTransitionError> {
        self.check(EventState::Draft, EventState::Confirmed)?;
        self.participant_role_id = Some(role);
        self.state = EventState::Confirmed;
        self.updated_at = now;
        Ok(())
    }

    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<(), EventTransitionError> {
        self.check(EventState::Confirmed, EventState::Active)?;
        self.state = EventState::Active;
        self.updated_at = now;
        Ok(())
    }

    /// Move to Closed and hand back the participant role so the caller can
    /// release it. Closing an already closed event is an error.
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<Option<RoleId>, EventTransitionError> {
        if self.state == EventState::Closed {
            return Err(EventTransitionError {
                from: EventState::Closed,
                to: EventState::Closed,
            });
        }
        self.state = EventState::Closed;
        self.updated_at = now;
        Ok(self.participant_role_id.take())
    }

    fn check(&self, expected: EventState, to: EventState) -> Result<(), EventTransitionError> {
        if self.state != expected {
            return Err(EventTransitionError {
                from: self.state,
                to,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> DraftRules {
        DraftRules {
            local_offset: FixedOffset::east_opt(3600).unwrap(),
            min_lead: Duration::minutes(5),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_local_format_with_offset() {
        let dt = parse_datetime("15/03/2026 20:30", FixedOffset::east_opt(3600).unwrap()).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2026, 3, 15, 19, 30, 0).unwrap());
    }

    #[test]
    fn parses_rfc3339() {
        let dt = parse_datetime("2026-03-15T20:30:00+02:00", FixedOffset::east_opt(0).unwrap()).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2026, 3, 15, 18, 30, 0).unwrap());
        assert!(parse_datetime("next tuesday-ish", FixedOffset::east_opt(0).unwrap()).is_none());
    }

    #[test]
    fn draft_defaults_end_and_title() {
        let fields = DraftFields {
            start_time: Some("15/03/2026 20:30".to_string()),
            ..Default::default()
        };
        let draft = EventDraft::from_fields(&fields, now(), &rules()).unwrap();

        assert_eq!(draft.title, "Untitled event");
        assert_eq!(draft.description, "No description");
        assert_eq!(draft.window.end - draft.window.start, Duration::hours(1));
    }

    #[test]
    fn draft_rejects_missing_start_and_inverted_window() {
        let missing = DraftFields::default();
        assert_eq!(
            EventDraft::from_fields(&missing, now(), &rules()),
            Err(DraftError::MissingStart)
        );

        let inverted = DraftFields {
            start_time: Some("15/03/2026 20:30".to_string()),
            end_time: Some("15/03/2026 19:00".to_string()),
            ..Default::default()
        };
        assert_eq!(
            EventDraft::from_fields(&inverted, now(), &rules()),
            Err(DraftError::EndBeforeStart)
        );
    }

    #[test]
    fn draft_rejects_start_too_close() {
        let fields = DraftFields {
            start_time: Some((now() + Duration::minutes(2)).to_rfc3339()),
            ..Default::default()
        };
        assert_eq!(
            EventDraft::from_fields(&fields, now(), &rules()),
            Err(DraftError::TooSoon { minutes: 5 })
        );
    }

    #[test]
    fn draft_truncates_long_title() {
        let fields = DraftFields {
            name: Some("é".repeat(150)),
            start_time: Some("15/03/2026 20:30".to_string()),
            ..Default::default()
        };
        let draft = EventDraft::from_fields(&fields, now(), &rules()).unwrap();
        assert_eq!(draft.title.chars().count(), 100);
    }

    #[test]
    fn event_lifecycle_releases_role_only_at_close() {
        let fields = DraftFields {
            name: Some("Donjon".to_string()),
            start_time: Some("15/03/2026 20:30".to_string()),
            ..Default::default()
        };
        let draft = EventDraft::from_fields(&fields, now(), &rules()).unwrap();
        let mut event = ScheduledEvent::from_draft(&draft, UserId(1), now());
        assert_eq!(event.state, EventState::Draft);
        assert!(event.participant_role_id.is_none());

        assert!(event.activate(now()).is_err());

        event.confirm(RoleId(99), now()).unwrap();
        assert_eq!(event.participant_role_id, Some(RoleId(99)));

        event.activate(now()).unwrap();
        assert_eq!(event.close(now()).unwrap(), Some(RoleId(99)));
        assert!(event.participant_role_id.is_none());
        assert!(event.close(now()).is_err());
    }
}
