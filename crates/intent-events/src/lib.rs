//! Intent events for the orchestrator
//!
//! The language pipeline is an external collaborator that hands over one structured record
//! per recognized input segment. This crate turns those records into immutable
//! [`Utterance`] values, validating what must be present and repairing minor violations.

mod entities;
mod normalizer;
mod utterance;

pub use entities::{Entity, Span};
pub use normalizer::{normalize, normalize_json, MalformedInputError, RawEntity, RawInput};
pub use utterance::{Utterance, UtteranceId};

/// Intent names with built-in meaning for the dialogue layer.
pub mod intents {
    pub const CONFIRM: &str = "confirm";
    pub const DENY: &str = "deny";
    pub const END_CONVERSATION: &str = "end_conversation";
}
