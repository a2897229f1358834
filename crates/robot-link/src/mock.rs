use crate::{ActionStep, LinkConnector, LinkError, Result, RobotLink, StepCommand, StepStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

/// A step the mock robot was asked to execute.
#[derive(Debug, Clone)]
pub struct ExecutedStep {
    pub command: StepCommand,
    pub status: StepStatus,
    pub started_at: OffsetDateTime,
}

#[derive(Default)]
struct Script {
    connect_failures: u32,
    outcomes: VecDeque<StepStatus>,
    log: Vec<ExecutedStep>,
    connects: u32,
}

/// An in-process robot that logs commands instead of moving hardware.
///
/// Behaviour can be scripted for tests: connect failures, per-step outcomes, step latency
/// and link loss. It also records the highest number of steps ever executing at once.
pub struct MockRobot {
    endpoint: String,
    latency: Mutex<Duration>,
    online: AtomicBool,
    connected: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    script: Mutex<Script>,
}

impl MockRobot {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            latency: Mutex::new(Duration::ZERO),
            online: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            script: Mutex::new(Script::default()),
        }
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.script.lock().connect_failures = n;
    }

    /// Queue outcomes for the next executed steps. Unscripted steps succeed.
    pub fn script_outcomes(&self, outcomes: impl IntoIterator<Item = StepStatus>) {
        self.script.lock().outcomes.extend(outcomes);
    }

    /// Simulate the robot dropping off the network (or coming back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<ExecutedStep> {
        self.script.lock().log.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.script.lock().connects
    }

    pub fn max_concurrent_steps(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RobotLink for MockRobot {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<()> {
        let mut script = self.script.lock();
        script.connects += 1;
        if !self.online.load(Ordering::SeqCst) {
            return Err(LinkError::Unreachable(self.endpoint.clone()));
        }
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(LinkError::Unreachable(self.endpoint.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "[mock] connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, "[mock] disconnected");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(LinkError::Unreachable(self.endpoint.clone()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    async fn execute(&self, step: &ActionStep) -> StepStatus {
        let started_at = OffsetDateTime::now_utc();
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        match &step.command {
            StepCommand::Speak { text, animated } => {
                info!(animated, "[mock] say: {}", text)
            }
            StepCommand::Gesture { animation } => info!("[mock] gesture: {}", animation),
            StepCommand::Move { target } => info!("[mock] move to: {}", target),
            StepCommand::Wait => info!("[mock] wait {:?}", step.expected_duration),
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let status = if !self.connected.load(Ordering::SeqCst) {
            StepStatus::HardwareError("not connected".to_string())
        } else {
            self.script
                .lock()
                .outcomes
                .pop_front()
                .unwrap_or(StepStatus::Ok)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.script.lock().log.push(ExecutedStep {
            command: step.command.clone(),
            status: status.clone(),
            started_at,
        });
        status
    }
}

/// Hands out one [`MockRobot`] per session and keeps it for inspection until the session closes.
#[derive(Default)]
pub struct MockConnector {
    latency: Duration,
    robots: Mutex<HashMap<String, Arc<MockRobot>>>,
}

impl MockConnector {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            robots: Mutex::new(HashMap::new()),
        }
    }

    pub fn robot(&self, session_id: &str) -> Option<Arc<MockRobot>> {
        self.robots.lock().get(session_id).cloned()
    }
}

impl LinkConnector for MockConnector {
    fn open(&self, session_id: &str) -> Result<Arc<dyn RobotLink>> {
        let robot = self
            .robots
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(MockRobot::new(format!("mock://{session_id}")).with_latency(self.latency))
            })
            .clone();
        Ok(robot)
    }

    fn close(&self, session_id: &str) {
        if self.robots.lock().remove(session_id).is_some() {
            debug!(session_id, "mock robot released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let robot = MockRobot::new("mock://test");
        robot.connect().await.unwrap();
        robot.script_outcomes([StepStatus::Timeout]);

        assert_eq!(robot.execute(&ActionStep::speak("hi")).await, StepStatus::Timeout);
        assert_eq!(robot.execute(&ActionStep::gesture("Joy")).await, StepStatus::Ok);
        assert_eq!(robot.executed().len(), 2);
        assert_eq!(robot.max_concurrent_steps(), 1);
    }

    #[tokio::test]
    async fn offline_robot_refuses_connect_and_ping() {
        let robot = MockRobot::new("mock://test");
        robot.connect().await.unwrap();
        robot.set_online(false);

        assert!(robot.ping().await.is_err());
        assert!(robot.connect().await.is_err());
        let status = robot.execute(&ActionStep::speak("hello")).await;
        assert!(matches!(status, StepStatus::HardwareError(_)));
    }

    #[test]
    fn connector_reuses_robot_per_session() {
        let connector = MockConnector::new(Duration::ZERO);
        let a = connector.open("alice").unwrap();
        let _ = connector.open("alice").unwrap();
        assert_eq!(a.endpoint(), "mock://alice");
        assert!(connector.robot("alice").is_some());
        assert!(connector.robot("bob").is_none());

        connector.close("alice");
        assert!(connector.robot("alice").is_none());
        connector.open("alice").unwrap();
        assert!(connector.robot("alice").is_some());
    }
}
