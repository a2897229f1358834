//! Session lifecycle: connect with bounded exponential backoff, heartbeat supervision and
//! deterministic disconnect.
//!
//! The current [`SessionState`] is published on a `watch` channel; subscribers get a
//! read-only view and cannot influence the lifecycle.

use crate::{ConnectionError, LinkError, RobotLink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry schedule for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Retries after the first attempt before giving up
    pub max_retries: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let base_ms = self.base.as_millis();
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let cap_ms = self.cap.as_millis().max(base_ms);
        let multiplier = 1u128 << retry.min(20);
        let millis = base_ms.saturating_mul(multiplier).min(cap_ms);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// The full schedule, one delay per allowed retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(move |retry| self.delay(retry))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub backoff: BackoffPolicy,
    /// Bound on a single connect attempt; an attempt that runs longer counts as failed
    pub connect_timeout: Duration,
    /// Also bounds each ping
    pub heartbeat_interval: Duration,
    /// Consecutive failed pings before the session is considered degraded
    pub missed_heartbeat_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeat_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub retry_count: u32,
    pub last_heartbeat: Option<OffsetDateTime>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            retry_count: 0,
            last_heartbeat: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Alive,
    Missed { missed: u32 },
    Reconnected,
    NotConnected,
}

/// Owns the connection lifecycle of one robot link.
pub struct SessionManager {
    link: Arc<dyn RobotLink>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    missed: u32,
}

impl SessionManager {
    pub fn new(link: Arc<dyn RobotLink>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            link,
            config,
            state,
            missed: 0,
        }
    }

    pub fn link(&self) -> Arc<dyn RobotLink> {
        self.link.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Connect, retrying with exponential backoff until `max_retries` is spent.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        let backoff = self.config.backoff;
        let mut retry = 0u32;
        loop {
            self.state.send_modify(|s| {
                s.connection = ConnectionState::Connecting;
                s.retry_count = retry;
            });

            let limit = self.config.connect_timeout;
            let attempt = tokio::time::timeout(limit, self.link.connect())
                .await
                .unwrap_or(Err(LinkError::Timeout(limit)));
            match attempt {
                Ok(()) => {
                    self.missed = 0;
                    self.state.send_modify(|s| {
                        s.connection = ConnectionState::Connected;
                        s.retry_count = 0;
                        s.last_heartbeat = Some(OffsetDateTime::now_utc());
                    });
                    info!(endpoint = self.link.endpoint(), attempts = retry + 1, "robot session connected");
                    return Ok(());
                }
                Err(e) if retry >= backoff.max_retries => {
                    self.state.send_modify(|s| {
                        s.connection = ConnectionState::Disconnected;
                        s.retry_count = retry;
                    });
                    error!(endpoint = self.link.endpoint(), attempts = retry + 1, error = %e, "giving up on robot session");
                    return Err(ConnectionError::RetriesExhausted {
                        attempts: retry + 1,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = backoff.delay(retry);
                    warn!(endpoint = self.link.endpoint(), retry, ?delay, error = %e, "connect failed, backing off");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }

    /// Probe the link once. After `missed_heartbeat_threshold` consecutive misses the session
    /// is marked degraded and a reconnect is attempted.
    pub async fn heartbeat(&mut self) -> Result<HeartbeatOutcome, ConnectionError> {
        if self.state.borrow().connection == ConnectionState::Disconnected {
            return Ok(HeartbeatOutcome::NotConnected);
        }

        let limit = self.config.heartbeat_interval;
        let ping = tokio::time::timeout(limit, self.link.ping())
            .await
            .unwrap_or(Err(LinkError::Timeout(limit)));
        match ping {
            Ok(()) => {
                self.missed = 0;
                self.state.send_modify(|s| {
                    s.connection = ConnectionState::Connected;
                    s.last_heartbeat = Some(OffsetDateTime::now_utc());
                });
                debug!(endpoint = self.link.endpoint(), "heartbeat ok");
                Ok(HeartbeatOutcome::Alive)
            }
            Err(e) => {
                self.missed += 1;
                warn!(endpoint = self.link.endpoint(), missed = self.missed, error = %e, "heartbeat missed");
                if self.missed < self.config.missed_heartbeat_threshold {
                    return Ok(HeartbeatOutcome::Missed {
                        missed: self.missed,
                    });
                }

                self.state
                    .send_modify(|s| s.connection = ConnectionState::Degraded);
                warn!(endpoint = self.link.endpoint(), "robot session degraded, reconnecting");
                self.release_link().await;
                self.connect().await?;
                Ok(HeartbeatOutcome::Reconnected)
            }
        }
    }

    /// Release the session. Safe to call in any state.
    pub async fn disconnect(&mut self) -> Result<(), LinkError> {
        let result = self.link.disconnect().await;
        self.missed = 0;
        self.state.send_modify(|s| {
            s.connection = ConnectionState::Disconnected;
            s.retry_count = 0;
        });
        info!(endpoint = self.link.endpoint(), "robot session released");
        result
    }

    /// Run heartbeats every `heartbeat_interval` until `shutdown` fires or reconnecting fails.
    /// Shutdown also cuts short a reconnect that is backing off.
    pub async fn supervise(mut self, shutdown: CancellationToken) -> Result<(), ConnectionError> {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        outcome = self.heartbeat() => {
                            outcome?;
                        }
                    }
                }
            }
        }

        if let Err(e) = self.disconnect().await {
            warn!(endpoint = self.link.endpoint(), error = %e, "disconnect failed during shutdown");
        }
        Ok(())
    }

    async fn release_link(&self) {
        if let Err(e) = self.link.disconnect().await {
            debug!(endpoint = self.link.endpoint(), error = %e, "release before reconnect failed");
        }
    }
}
