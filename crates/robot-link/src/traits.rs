use crate::{ActionStep, Result, StepStatus};
use async_trait::async_trait;
use std::sync::Arc;

/// A control session with one robot.
///
/// Implementations use interior mutability: the session manager drives the lifecycle
/// methods while the dispatcher is the only caller of [`RobotLink::execute`].
#[async_trait]
pub trait RobotLink: Send + Sync {
    /// Human readable endpoint description (address, device name)
    fn endpoint(&self) -> &str;

    /// Establish the session. One attempt, no retry.
    async fn connect(&self) -> Result<()>;

    /// Release the session. Must be idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Cheap liveness check used by heartbeat supervision.
    async fn ping(&self) -> Result<()>;

    /// Execute one step to completion. Runs until the hardware reports; callers bound it
    /// with their own timeout.
    async fn execute(&self, step: &ActionStep) -> StepStatus;
}

/// Opens a dedicated link for a conversation session.
pub trait LinkConnector: Send + Sync {
    fn open(&self, session_id: &str) -> Result<Arc<dyn RobotLink>>;

    /// Forget the session's link once its session has ended.
    fn close(&self, _session_id: &str) {}
}
