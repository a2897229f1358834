use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = LinkError> = core::result::Result<T, E>;

/// Failure of a single link operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("robot unreachable: {0}")]
    Unreachable(String),
    #[error("link is not connected")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("no answer from robot within {0:?}")]
    Timeout(Duration),
}

/// The robot session could not be (re)established.
///
/// Raised once the backoff budget is spent; callers must treat it as fatal for the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: LinkError },
}
