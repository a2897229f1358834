//! Dialogue layer: per-session conversation context and the intent-to-plan resolver
//!
//! The [`Resolver`] is a pure function of an utterance and the current [`Context`]; it
//! proposes a [`ContextDelta`] and optionally an [`ActionPlan`]. The [`ContextStore`] is the
//! only place a context is mutated, through its atomic `apply`.

mod context;
pub use context::{Context, ContextDelta, ContextStore, ContextStoreConfig, PendingChange, PendingConfirmation, Topic};

mod error;
pub use error::{RuleLoadError, RuleTableError};

mod plan;
pub use plan::{ActionPlan, PlanId, Priority};

pub mod reminder;
pub use reminder::Reminder;

pub mod rules;
pub use rules::{IntentRule, Persona, RuleEffect, RuleTable, StepTemplate};

mod resolver;
pub use resolver::{Resolution, Resolver, ResolverConfig};
