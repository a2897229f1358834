//! orchestrator: turns normalized utterances into robot behaviour
//!
//! One [`SessionWorker`] per conversation session processes that session's utterances in
//! arrival order, resolves them against the session context and drives an
//! [`ActionDispatcher`] over the session's robot link. The [`Orchestrator`] hub routes
//! utterances to workers, creating a worker and its supervised link on first contact.

mod config;
pub use config::{BrainConfig, OfflinePolicy, SessionSettings};

mod error;
pub use error::{ConfigError, OrchestratorError, StepExecutionError, StepFailure};

mod metrics;
pub use metrics::{BrainMetrics, MetricsHub};

pub mod dispatcher;
pub use dispatcher::{ActionDispatcher, DispatchHandle, DispatchState, DispatchStatus};

mod worker;
pub use worker::{DropReason, LoopState, OrchestratorEvent, SessionServices, SessionWorker, WorkerSettings};

mod hub;
pub use hub::{Orchestrator, SessionExit};
