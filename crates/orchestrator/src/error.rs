use dialogue::PlanId;
use robot_link::ConnectionError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    Timeout,
    Hardware(String),
}

/// A step did not complete; the rest of its plan was skipped.
#[derive(Debug, Clone, Error)]
#[error("plan {plan_id} failed at step {step_index}: {failure:?}")]
pub struct StepExecutionError {
    pub plan_id: PlanId,
    pub step_index: usize,
    /// Index of the last step that completed, `None` if the first step failed
    pub last_completed: Option<usize>,
    pub failure: StepFailure,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("confidence_threshold must be within [0, 1], got {0}")]
    ConfidenceThreshold(f32),
    #[error("queue_bound must be at least 1")]
    ZeroQueueBound,
    #[error("history_limit must be at least 1")]
    ZeroHistoryLimit,
    #[error("backoff cap {cap_ms}ms is below base {base_ms}ms")]
    BackoffCap { base_ms: u64, cap_ms: u64 },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator is shut down")]
    ShutDown,
    #[error("{0}")]
    Metrics(String),
    #[error("opening robot link for session {session_id}: {source}")]
    Link {
        session_id: String,
        source: robot_link::LinkError,
    },
    #[error("session {session_id} lost its robot link: {source}")]
    Connection {
        session_id: String,
        source: ConnectionError,
    },
}
