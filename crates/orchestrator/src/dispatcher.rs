//! Action dispatcher
//!
//! Executes one [`ActionPlan`] at a time against a robot link, strictly in step order.
//! Cancellation is cooperative: the token is checked before each step, and a step that has
//! already been handed to the hardware runs until it completes or times out. A plan whose
//! cancellation was requested never reports `Completed`, even if its last step finished.

use crate::{StepExecutionError, StepFailure};
use dialogue::{ActionPlan, PlanId};
use robot_link::{RobotLink, StepStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl DispatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DispatchStatus::Completed | DispatchStatus::Cancelled | DispatchStatus::Failed
        )
    }
}

/// Snapshot of an in-flight plan, emitted on every transition.
#[derive(Debug, Clone)]
pub struct DispatchState {
    pub plan_id: PlanId,
    pub current_step_index: usize,
    pub status: DispatchStatus,
    pub last_status_ts: OffsetDateTime,
    /// Set when `status` is `Failed`
    pub error: Option<StepExecutionError>,
}

impl DispatchState {
    fn new(plan_id: PlanId, current_step_index: usize, status: DispatchStatus) -> Self {
        Self {
            plan_id,
            current_step_index,
            status,
            last_status_ts: OffsetDateTime::now_utc(),
            error: None,
        }
    }
}

/// Observer and cancel switch for one dispatched plan.
///
/// The state sequence is finite and ends with a terminal status. Dropping the handle does
/// not cancel the plan.
pub struct DispatchHandle {
    plan_id: PlanId,
    cancel: CancellationToken,
    states: mpsc::UnboundedReceiver<DispatchState>,
    finished: bool,
}

impl DispatchHandle {
    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// Request cancellation; observed before the next cancellable step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next state transition. `None` once the terminal state has been returned, or if the
    /// executing task went away without reporting one.
    pub async fn next_state(&mut self) -> Option<DispatchState> {
        if self.finished {
            return None;
        }
        let state = self.states.recv().await;
        match &state {
            Some(s) if s.status.is_terminal() => self.finished = true,
            None => self.finished = true,
            Some(_) => {}
        }
        state
    }

    /// Drain transitions until the plan terminates.
    pub async fn wait(mut self) -> Option<DispatchState> {
        let mut last = None;
        while let Some(state) = self.next_state().await {
            last = Some(state);
        }
        last.filter(|s| s.status.is_terminal())
    }
}

/// Sole writer to a session's robot link.
#[derive(Clone)]
pub struct ActionDispatcher {
    link: Arc<dyn RobotLink>,
    step_timeout_margin: Duration,
    /// Held by the executing plan; a second plan stays `Pending` until it is released
    exclusive: Arc<Mutex<()>>,
}

impl ActionDispatcher {
    pub fn new(link: Arc<dyn RobotLink>, step_timeout_margin: Duration) -> Self {
        Self {
            link,
            step_timeout_margin,
            exclusive: Arc::new(Mutex::new(())),
        }
    }

    pub fn dispatch(&self, plan: Arc<ActionPlan>) -> DispatchHandle {
        let (tx, states) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let plan_id = plan.id();
        let _ = tx.send(DispatchState::new(plan_id, 0, DispatchStatus::Pending));

        tokio::spawn(run_plan(
            self.link.clone(),
            self.step_timeout_margin,
            self.exclusive.clone(),
            plan,
            cancel.clone(),
            tx,
        ));

        DispatchHandle {
            plan_id,
            cancel,
            states,
            finished: false,
        }
    }

    pub fn cancel(&self, handle: &DispatchHandle) {
        handle.cancel();
    }
}

async fn run_plan(
    link: Arc<dyn RobotLink>,
    margin: Duration,
    exclusive: Arc<Mutex<()>>,
    plan: Arc<ActionPlan>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<DispatchState>,
) {
    let _running = exclusive.lock_owned().await;
    let plan_id = plan.id();
    let mut last_completed: Option<usize> = None;

    for (index, step) in plan.steps().iter().enumerate() {
        if cancel.is_cancelled() {
            if step.cancellable {
                info!(%plan_id, step_index = index, "plan cancelled at step boundary");
                let _ = tx.send(DispatchState::new(plan_id, index, DispatchStatus::Cancelled));
                return;
            }
            debug!(%plan_id, step_index = index, "cancellation pending, step is not cancellable");
        }

        let _ = tx.send(DispatchState::new(plan_id, index, DispatchStatus::Running));
        let limit = step.expected_duration + margin;
        let status = match tokio::time::timeout(limit, link.execute(step)).await {
            Ok(status) => status,
            Err(_) => StepStatus::Timeout,
        };

        let failure = match status {
            StepStatus::Ok => {
                last_completed = Some(index);
                continue;
            }
            StepStatus::Timeout => StepFailure::Timeout,
            StepStatus::HardwareError(reason) => StepFailure::Hardware(reason),
        };

        let error = StepExecutionError {
            plan_id,
            step_index: index,
            last_completed,
            failure,
        };
        warn!(%plan_id, step_index = index, kind = %step.kind(), error = %error, "step failed, skipping rest of plan");
        let mut state = DispatchState::new(plan_id, index, DispatchStatus::Failed);
        state.error = Some(error);
        let _ = tx.send(state);
        return;
    }

    let status = if cancel.is_cancelled() {
        info!(%plan_id, "plan cancelled after its final step");
        DispatchStatus::Cancelled
    } else {
        debug!(%plan_id, steps = plan.steps().len(), "plan completed");
        DispatchStatus::Completed
    };
    let _ = tx.send(DispatchState::new(plan_id, plan.steps().len(), status));
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialogue::Priority;
    use robot_link::{ActionStep, MockRobot, StepCommand};

    async fn connected_robot(latency: Duration) -> Arc<MockRobot> {
        let robot = Arc::new(MockRobot::new("mock://test").with_latency(latency));
        robot.connect().await.unwrap();
        robot
    }

    fn plan(steps: Vec<ActionStep>) -> Arc<ActionPlan> {
        Arc::new(ActionPlan::new("test", steps, Priority::Normal, None))
    }

    async fn statuses(mut handle: DispatchHandle) -> Vec<(DispatchStatus, usize)> {
        let mut out = Vec::new();
        while let Some(state) = handle.next_state().await {
            out.push((state.status, state.current_step_index));
        }
        out
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let robot = connected_robot(Duration::ZERO).await;
        let dispatcher = ActionDispatcher::new(robot.clone(), Duration::from_millis(100));
        let handle = dispatcher.dispatch(plan(vec![
            ActionStep::speak("one"),
            ActionStep::gesture("Joy"),
            ActionStep::speak("two"),
        ]));

        let seen = statuses(handle).await;
        assert_eq!(
            seen,
            vec![
                (DispatchStatus::Pending, 0),
                (DispatchStatus::Running, 0),
                (DispatchStatus::Running, 1),
                (DispatchStatus::Running, 2),
                (DispatchStatus::Completed, 3),
            ]
        );
        let executed = robot.executed();
        assert_eq!(executed.len(), 3);
        assert_eq!(
            executed[1].command,
            StepCommand::Gesture {
                animation: "Joy".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let robot = connected_robot(Duration::ZERO).await;
        robot.script_outcomes([StepStatus::Ok, StepStatus::HardwareError("servo".into())]);
        let dispatcher = ActionDispatcher::new(robot.clone(), Duration::from_millis(100));
        let handle = dispatcher.dispatch(plan(vec![
            ActionStep::speak("one"),
            ActionStep::move_to("kitchen"),
            ActionStep::speak("never"),
        ]));

        let terminal = handle.wait().await.unwrap();
        assert_eq!(terminal.status, DispatchStatus::Failed);
        let error = terminal.error.unwrap();
        assert_eq!(error.step_index, 1);
        assert_eq!(error.last_completed, Some(0));
        assert_eq!(error.failure, StepFailure::Hardware("servo".into()));
        assert_eq!(robot.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_step_times_out() {
        let robot = connected_robot(Duration::from_millis(500)).await;
        let dispatcher = ActionDispatcher::new(robot.clone(), Duration::from_millis(10));
        let handle = dispatcher.dispatch(plan(vec![ActionStep::wait(Duration::from_millis(10))]));

        let terminal = handle.wait().await.unwrap();
        assert_eq!(terminal.status, DispatchStatus::Failed);
        let error = terminal.error.unwrap();
        assert_eq!(error.failure, StepFailure::Timeout);
        assert_eq!(error.last_completed, None);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_in_flight_step() {
        let robot = connected_robot(Duration::from_millis(50)).await;
        let dispatcher = ActionDispatcher::new(robot.clone(), Duration::from_secs(1));
        let mut handle = dispatcher.dispatch(plan(vec![
            ActionStep::speak("first"),
            ActionStep::speak("second"),
        ]));

        // wait until the first step is with the hardware
        loop {
            let state = handle.next_state().await.unwrap();
            if state.status == DispatchStatus::Running {
                break;
            }
        }
        dispatcher.cancel(&handle);

        let terminal = handle.wait().await.unwrap();
        assert_eq!(terminal.status, DispatchStatus::Cancelled);
        assert_eq!(terminal.current_step_index, 1);
        // the committed step finished, the next one never started
        assert_eq!(robot.executed().len(), 1);
        assert!(robot.executed()[0].status.is_ok());
    }

    #[tokio::test]
    async fn test_non_cancellable_step_still_runs() {
        let robot = connected_robot(Duration::from_millis(20)).await;
        let dispatcher = ActionDispatcher::new(robot.clone(), Duration::from_secs(1));
        let handle = dispatcher.dispatch(plan(vec![
            ActionStep::speak("stopping").non_cancellable(),
            ActionStep::speak("optional"),
        ]));
        handle.cancel();

        let terminal = handle.wait().await.unwrap();
        assert_eq!(terminal.status, DispatchStatus::Cancelled);
        assert_eq!(terminal.current_step_index, 1);
        assert_eq!(robot.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_last_step_reports_cancelled() {
        let robot = connected_robot(Duration::from_millis(50)).await;
        let dispatcher = ActionDispatcher::new(robot.clone(), Duration::from_secs(1));
        let mut handle = dispatcher.dispatch(plan(vec![ActionStep::speak("only")]));

        loop {
            let state = handle.next_state().await.unwrap();
            if state.status == DispatchStatus::Running {
                break;
            }
        }
        handle.cancel();

        let terminal = handle.wait().await.unwrap();
        assert_eq!(terminal.status, DispatchStatus::Cancelled);
        assert_eq!(terminal.current_step_index, 1);
        assert_eq!(robot.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_second_plan_waits_for_first() {
        let robot = connected_robot(Duration::from_millis(20)).await;
        let dispatcher = ActionDispatcher::new(robot.clone(), Duration::from_secs(1));
        let first = dispatcher.dispatch(plan(vec![ActionStep::speak("a"), ActionStep::speak("b")]));
        let second = dispatcher.dispatch(plan(vec![ActionStep::speak("c")]));

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.unwrap().status, DispatchStatus::Completed);
        assert_eq!(b.unwrap().status, DispatchStatus::Completed);
        assert_eq!(robot.max_concurrent_steps(), 1);
    }
}
