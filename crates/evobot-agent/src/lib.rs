// ABOUTME: Conversation and event logic for evobot, built on the durable store and leader lease.
// ABOUTME: Holds the per-user conversation flow, event lifecycle, synthesis providers, and collaborator traits.

pub mod collab;
pub mod flow;
pub mod lifecycle;
pub mod providers;
pub mod synthesis;
pub mod testing;

pub use collab::{Announcer, CollaboratorError, RoleManager, participant_role_name};
pub use flow::{CONVERSATIONS_KEY, ConversationFlow, FlowError, FlowOptions, FlowReply, RecoveryReport};
pub use lifecycle::{EVENTS_KEY, EventBook, EventLifecycle, LifecycleError, ReconcileReport};
pub use providers::OpenAiSynthesizer;
pub use synthesis::{SynthesisError, Synthesizer};
