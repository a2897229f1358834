use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct BrainMetrics {
    pub utterances: IntCounter,
    pub utterances_dropped: IntCounter,
    pub plans_dispatched: IntCounter,
    pub plans_completed: IntCounter,
    pub plans_cancelled: IntCounter,
    pub plans_failed: IntCounter,
    pub sessions_active: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub brain: BrainMetrics,
}

fn init_error(e: prometheus::Error) -> String {
    format!("metrics init error: {e}")
}

fn counter(name: &str, help: &str) -> Result<IntCounter, String> {
    IntCounter::new(name, help).map_err(init_error)
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        Self::with_registry(Registry::new())
    }

    /// Register the brain metrics in `registry`; fails if any name is already taken.
    pub fn with_registry(registry: Registry) -> Result<Self, String> {
        let brain = BrainMetrics {
            utterances: counter("brain_utterances_total", "Utterances accepted for processing")?,
            utterances_dropped: counter(
                "brain_utterances_dropped_total",
                "Utterances dropped by queue overflow or offline policy",
            )?,
            plans_dispatched: counter("brain_plans_dispatched_total", "Action plans handed to a dispatcher")?,
            plans_completed: counter("brain_plans_completed_total", "Action plans that ran every step")?,
            plans_cancelled: counter("brain_plans_cancelled_total", "Action plans cancelled before finishing")?,
            plans_failed: counter("brain_plans_failed_total", "Action plans aborted by a step failure")?,
            sessions_active: IntGauge::new("brain_sessions_active", "Conversation sessions with a live worker")
                .map_err(init_error)?,
        };
        for counter in [
            &brain.utterances,
            &brain.utterances_dropped,
            &brain.plans_dispatched,
            &brain.plans_completed,
            &brain.plans_cancelled,
            &brain.plans_failed,
        ] {
            registry.register(Box::new(counter.clone())).map_err(init_error)?;
        }
        registry
            .register(Box::new(brain.sessions_active.clone()))
            .map_err(init_error)?;
        Ok(Self { registry, brain })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exposition_names() {
        let hub = MetricsHub::new().unwrap();
        hub.brain.utterances.inc();
        hub.brain.sessions_active.set(2);
        let text = hub.encode_text();
        assert!(text.contains("brain_utterances_total 1"));
        assert!(text.contains("brain_sessions_active 2"));
        assert!(text.contains("brain_plans_failed_total 0"));
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let registry = Registry::new();
        MetricsHub::with_registry(registry.clone()).unwrap();
        let err = MetricsHub::with_registry(registry).err().unwrap();
        assert!(err.starts_with("metrics init error"));
    }
}
