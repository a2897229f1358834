use crate::ConfigError;
use anyhow::Context;
use dialogue::{ContextStoreConfig, ResolverConfig};
use robot_link::{BackoffPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// What a session does with input while its robot link is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    /// Hold input in the bounded queue until the link returns
    #[default]
    Queue,
    /// Discard input (logged)
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub missed_heartbeat_threshold: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            max_retries: 5,
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            missed_heartbeat_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub idle_timeout_ms: u64,
    pub queue_bound: usize,
    pub confidence_threshold: f32,
    pub history_limit: usize,
    pub confirmation_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub step_timeout_margin_ms: u64,
    pub offline_policy: OfflinePolicy,
    pub greeting: Option<String>,
    pub session: SessionSettings,
    pub rules_path: Option<PathBuf>,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            queue_bound: 8,
            confidence_threshold: 0.6,
            history_limit: 10,
            confirmation_timeout_ms: 30_000,
            sweep_interval_ms: 60_000,
            step_timeout_margin_ms: 2_000,
            offline_policy: OfflinePolicy::Queue,
            greeting: None,
            session: SessionSettings::default(),
            rules_path: None,
        }
    }
}

impl BrainConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: BrainConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("decoding config: {}", path.display()))?;
        Ok(config)
    }

    /// Apply `BRAIN_CONFIDENCE_THRESHOLD` and `BRAIN_QUEUE_BOUND` when set.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(raw) = lookup("BRAIN_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = raw
                .trim()
                .parse()
                .with_context(|| format!("BRAIN_CONFIDENCE_THRESHOLD={raw}"))?;
            info!(threshold = self.confidence_threshold, "confidence threshold from environment");
        }
        if let Some(raw) = lookup("BRAIN_QUEUE_BOUND") {
            self.queue_bound = raw
                .trim()
                .parse()
                .with_context(|| format!("BRAIN_QUEUE_BOUND={raw}"))?;
            info!(queue_bound = self.queue_bound, "queue bound from environment");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::ConfidenceThreshold(self.confidence_threshold));
        }
        if self.queue_bound == 0 {
            return Err(ConfigError::ZeroQueueBound);
        }
        if self.history_limit == 0 {
            return Err(ConfigError::ZeroHistoryLimit);
        }
        if self.session.backoff_cap_ms < self.session.backoff_base_ms {
            return Err(ConfigError::BackoffCap {
                base_ms: self.session.backoff_base_ms,
                cap_ms: self.session.backoff_cap_ms,
            });
        }
        for (name, value) in [
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("session.connect_timeout_ms", self.session.connect_timeout_ms),
            ("session.heartbeat_interval_ms", self.session.heartbeat_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.session.backoff_base_ms),
                cap: Duration::from_millis(self.session.backoff_cap_ms),
                max_retries: self.session.max_retries,
            },
            connect_timeout: Duration::from_millis(self.session.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.session.heartbeat_interval_ms),
            missed_heartbeat_threshold: self.session.missed_heartbeat_threshold,
        }
    }

    pub fn context_store_config(&self) -> ContextStoreConfig {
        ContextStoreConfig {
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            history_limit: self.history_limit,
            confirmation_timeout: Duration::from_millis(self.confirmation_timeout_ms),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            confidence_threshold: self.confidence_threshold,
        }
    }

    pub fn step_timeout_margin(&self) -> Duration {
        Duration::from_millis(self.step_timeout_margin_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
