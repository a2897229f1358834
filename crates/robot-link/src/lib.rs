//! robot-link: the robot control session
//!
//! This crate provides the capability the orchestrator drives: a [`RobotLink`] executes one
//! [`ActionStep`] at a time and reports a [`StepStatus`]. Connection lifecycle (connect with
//! bounded exponential backoff, heartbeat supervision, deterministic disconnect) lives in
//! [`SessionManager`]. The default build enables a `mock` backend so that binaries and tests
//! run on any host without a robot attached.

mod types;
pub use types::{ActionStep, StepCommand, StepKind, StepStatus};

mod error;
pub use error::{ConnectionError, LinkError, Result};

mod traits;
pub use traits::{LinkConnector, RobotLink};

pub mod session;
pub use session::{BackoffPolicy, ConnectionState, HeartbeatOutcome, SessionConfig, SessionManager, SessionState};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{ExecutedStep, MockConnector, MockRobot};
