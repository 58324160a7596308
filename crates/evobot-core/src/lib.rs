// ABOUTME: Core library for evobot, containing the domain types shared by every crate.
// ABOUTME: Defines ids, the clock abstraction, leases, member tables, sessions, and scheduled events.

pub mod clock;
pub mod event;
pub mod ids;
pub mod lease;
pub mod member;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{
    DraftError, DraftFields, DraftRules, EventDraft, EventState, EventTransitionError, EventWindow,
    ScheduledEvent,
};
pub use ids::{ChannelId, MessageId, RoleId, UserId};
pub use lease::LeaderLease;
pub use member::{CanonicalEntry, LegacyEntry, MemberTable};
pub use session::{ConversationSession, SessionStatus, TransitionError};
