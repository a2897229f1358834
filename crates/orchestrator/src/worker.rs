//! Per-session orchestration loop
//!
//! A [`SessionWorker`] owns one conversation: it is the only writer of that session's
//! context and the only caller of its dispatcher. Utterances are handled in arrival order.
//! An interrupt-priority utterance cancels the running plan and runs as soon as the
//! dispatcher reports a terminal state; queued input then resumes in arrival order.
//! Reminders stored in the context are spoken when they come due, once the loop is idle.

use crate::dispatcher::{ActionDispatcher, DispatchHandle, DispatchState, DispatchStatus};
use crate::{BrainMetrics, OfflinePolicy, StepExecutionError};
use dialogue::{ActionPlan, ContextStore, PlanId, Priority, Resolver};
use intent_events::{Utterance, UtteranceId};
use robot_link::{RobotLink, SessionState};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Label of recovery plans; a failed apology is not apologised for.
const APOLOGY_LABEL: &str = "apology";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    /// A plan is dispatching
    AwaitingResponse,
    /// Cancellation issued, waiting for the dispatcher to report a terminal state
    Interrupting,
    /// Robot link is down
    Error,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => write!(f, "idle"),
            LoopState::AwaitingResponse => write!(f, "awaiting_response"),
            LoopState::Interrupting => write!(f, "interrupting"),
            LoopState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The pending queue was full
    QueueOverflow,
    /// Arrived while the link was down and the offline policy is `drop`
    Offline,
}

/// Everything observable about the orchestrator, in the order it happened per session.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    UtteranceReceived {
        session_id: String,
        utterance: Arc<Utterance>,
    },
    UtteranceDropped {
        session_id: String,
        utterance_id: UtteranceId,
        reason: DropReason,
    },
    PlanStarted {
        session_id: String,
        plan: Arc<ActionPlan>,
    },
    Dispatch {
        session_id: String,
        state: DispatchState,
    },
    PlanFinished {
        session_id: String,
        plan_id: PlanId,
        status: DispatchStatus,
        error: Option<StepExecutionError>,
    },
    StateChanged {
        session_id: String,
        from: LoopState,
        to: LoopState,
    },
    SessionClosed {
        session_id: String,
    },
}

impl OrchestratorEvent {
    pub fn session_id(&self) -> &str {
        match self {
            OrchestratorEvent::UtteranceReceived { session_id, .. }
            | OrchestratorEvent::UtteranceDropped { session_id, .. }
            | OrchestratorEvent::PlanStarted { session_id, .. }
            | OrchestratorEvent::Dispatch { session_id, .. }
            | OrchestratorEvent::PlanFinished { session_id, .. }
            | OrchestratorEvent::StateChanged { session_id, .. }
            | OrchestratorEvent::SessionClosed { session_id } => session_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue_bound: usize,
    pub offline_policy: OfflinePolicy,
    /// Spoken once, the first time the link comes up
    pub greeting: Option<String>,
    pub step_timeout_margin: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_bound: 8,
            offline_policy: OfflinePolicy::Queue,
            greeting: None,
            step_timeout_margin: Duration::from_secs(2),
        }
    }
}

/// Collaborators shared by every worker of one orchestrator.
#[derive(Clone)]
pub struct SessionServices {
    pub store: Arc<ContextStore>,
    pub resolver: Arc<Resolver>,
    pub events: broadcast::Sender<OrchestratorEvent>,
    pub metrics: BrainMetrics,
    pub settings: WorkerSettings,
}

struct InFlight {
    handle: DispatchHandle,
    plan: Arc<ActionPlan>,
}

pub struct SessionWorker {
    session_id: String,
    services: SessionServices,
    dispatcher: ActionDispatcher,
    link_state: watch::Receiver<SessionState>,
    inbox: mpsc::Receiver<Arc<Utterance>>,
    state: LoopState,
    queue: VecDeque<Arc<Utterance>>,
    /// Interrupts waiting for the cancelled plan to settle, oldest first
    interrupts: VecDeque<Arc<Utterance>>,
    /// Reminder plans waiting for the loop to go idle
    reminders: VecDeque<Arc<ActionPlan>>,
    next_reminder: Option<OffsetDateTime>,
    current: Option<InFlight>,
    greeted: bool,
}

impl SessionWorker {
    pub fn new(
        session_id: impl Into<String>,
        services: SessionServices,
        link: Arc<dyn RobotLink>,
        link_state: watch::Receiver<SessionState>,
        inbox: mpsc::Receiver<Arc<Utterance>>,
    ) -> Self {
        let dispatcher = ActionDispatcher::new(link, services.settings.step_timeout_margin);
        Self {
            session_id: session_id.into(),
            services,
            dispatcher,
            link_state,
            inbox,
            state: LoopState::Idle,
            queue: VecDeque::new(),
            interrupts: VecDeque::new(),
            reminders: VecDeque::new(),
            next_reminder: None,
            current: None,
            greeted: false,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Process events until `shutdown` fires, the inbox closes or the link supervisor goes away.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(session_id = %self.session_id, "session worker started");
        if self.services.store.contains(&self.session_id) {
            self.next_reminder = self.services.store.get(&self.session_id).next_reminder_due();
        }
        let initial = self.link_state.borrow_and_update().clone();
        self.on_link_state(&initial);

        loop {
            self.drain_queue();

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = self.link_state.changed() => {
                    if changed.is_err() {
                        debug!(session_id = %self.session_id, "link supervisor ended");
                        self.on_link_state(&SessionState::default());
                        break;
                    }
                    let link = self.link_state.borrow_and_update().clone();
                    self.on_link_state(&link);
                }
                state = next_dispatch_state(&mut self.current) => self.on_dispatch_state(state),
                _ = reminder_due(self.next_reminder) => self.on_reminder_due(),
                received = self.inbox.recv() => match received {
                    Some(utterance) => self.on_utterance(utterance),
                    None => break,
                },
            }
        }

        self.stop().await;
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.services.events.send(event);
    }

    fn transition(&mut self, to: LoopState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(session_id = %self.session_id, %from, %to, "loop state changed");
        self.emit(OrchestratorEvent::StateChanged {
            session_id: self.session_id.clone(),
            from,
            to,
        });
    }

    fn drop_utterance(&self, utterance: &Utterance, reason: DropReason) {
        warn!(
            session_id = %self.session_id,
            utterance_id = %utterance.id(),
            intent = utterance.intent(),
            ?reason,
            "utterance dropped"
        );
        self.services.metrics.utterances_dropped.inc();
        self.emit(OrchestratorEvent::UtteranceDropped {
            session_id: self.session_id.clone(),
            utterance_id: utterance.id(),
            reason,
        });
    }

    fn on_utterance(&mut self, utterance: Arc<Utterance>) {
        self.services.metrics.utterances.inc();
        self.emit(OrchestratorEvent::UtteranceReceived {
            session_id: self.session_id.clone(),
            utterance: utterance.clone(),
        });

        match self.state {
            LoopState::Error => match self.services.settings.offline_policy {
                OfflinePolicy::Queue => self.enqueue(utterance),
                OfflinePolicy::Drop => self.drop_utterance(&utterance, DropReason::Offline),
            },
            LoopState::Idle => self.enqueue(utterance),
            LoopState::AwaitingResponse | LoopState::Interrupting => {
                if self.services.resolver.classify(&utterance) == Priority::Interrupt {
                    self.interrupt(utterance);
                } else {
                    self.enqueue(utterance);
                }
            }
        }
    }

    fn interrupt(&mut self, utterance: Arc<Utterance>) {
        if self.interrupts.len() >= self.services.settings.queue_bound {
            if let Some(dropped) = self.interrupts.pop_front() {
                self.drop_utterance(&dropped, DropReason::QueueOverflow);
            }
        }
        self.interrupts.push_back(utterance.clone());
        if let Some(current) = &self.current {
            info!(
                session_id = %self.session_id,
                utterance_id = %utterance.id(),
                plan_id = %current.handle.plan_id(),
                "interrupt received, cancelling running plan"
            );
            self.dispatcher.cancel(&current.handle);
        }
        self.transition(LoopState::Interrupting);
    }

    /// Queue behind the running plan, dropping the oldest non-interrupt entry on overflow.
    fn enqueue(&mut self, utterance: Arc<Utterance>) {
        if self.queue.len() >= self.services.settings.queue_bound {
            let resolver = &self.services.resolver;
            let victim = self
                .queue
                .iter()
                .position(|u| resolver.classify(u) != Priority::Interrupt)
                .unwrap_or(0);
            if let Some(dropped) = self.queue.remove(victim) {
                self.drop_utterance(&dropped, DropReason::QueueOverflow);
            }
        }
        self.queue.push_back(utterance);
    }

    /// While idle, start work until something is dispatched: interrupts first, then due
    /// reminders, then queued input.
    fn drain_queue(&mut self) {
        while self.state == LoopState::Idle {
            if let Some(utterance) = self.interrupts.pop_front() {
                self.process(utterance);
            } else if let Some(plan) = self.reminders.pop_front() {
                self.start(plan);
            } else if let Some(utterance) = self.queue.pop_front() {
                self.process(utterance);
            } else {
                break;
            }
        }
    }

    fn process(&mut self, utterance: Arc<Utterance>) {
        let resolver = &self.services.resolver;
        let (_, (plan, next_reminder)) = self.services.store.apply_with(&self.session_id, |context| {
            let resolution = resolver.resolve(&utterance, &context);
            let next = context.apply_delta(resolution.delta);
            let next_reminder = next.next_reminder_due();
            (next, (resolution.plan, next_reminder))
        });
        self.next_reminder = next_reminder;

        match plan {
            Some(plan) => self.start(plan),
            None => debug!(
                session_id = %self.session_id,
                utterance_id = %utterance.id(),
                "nothing to dispatch"
            ),
        }
    }

    fn on_reminder_due(&mut self) {
        let now = OffsetDateTime::now_utc();
        let (_, (due, next_reminder)) = self.services.store.apply_with(&self.session_id, |mut context| {
            let due = context.take_due_reminders(now);
            let next_reminder = context.next_reminder_due();
            (context, (due, next_reminder))
        });
        self.next_reminder = next_reminder;
        for reminder in due {
            info!(session_id = %self.session_id, message = %reminder.message, "reminder due");
            self.reminders.push_back(self.services.resolver.reminder_plan(&reminder));
        }
    }

    fn start(&mut self, plan: Arc<ActionPlan>) {
        info!(
            session_id = %self.session_id,
            plan_id = %plan.id(),
            label = plan.label(),
            steps = plan.steps().len(),
            "dispatching plan"
        );
        let handle = self.dispatcher.dispatch(plan.clone());
        self.services.metrics.plans_dispatched.inc();
        self.emit(OrchestratorEvent::PlanStarted {
            session_id: self.session_id.clone(),
            plan: plan.clone(),
        });
        self.current = Some(InFlight { handle, plan });
        self.transition(LoopState::AwaitingResponse);
    }

    fn on_dispatch_state(&mut self, state: Option<DispatchState>) {
        let Some(state) = state else {
            // executor went away without a terminal report
            if let Some(current) = self.current.take() {
                error!(
                    session_id = %self.session_id,
                    plan_id = %current.plan.id(),
                    "dispatch ended without a terminal state"
                );
                self.finish(current.plan, DispatchStatus::Failed, None);
            }
            return;
        };

        self.emit(OrchestratorEvent::Dispatch {
            session_id: self.session_id.clone(),
            state: state.clone(),
        });
        if !state.status.is_terminal() {
            return;
        }
        if let Some(current) = self.current.take() {
            self.finish(current.plan, state.status, state.error);
        }
    }

    /// Report a terminal plan, then decide what the loop does next.
    fn finish(&mut self, plan: Arc<ActionPlan>, status: DispatchStatus, error: Option<StepExecutionError>) {
        self.report(&plan, status, error);

        match self.state {
            LoopState::Error => {}
            LoopState::Interrupting => self.transition(LoopState::Idle),
            LoopState::Idle | LoopState::AwaitingResponse => {
                if status == DispatchStatus::Failed && plan.label() != APOLOGY_LABEL {
                    let apology = self.services.resolver.apology_plan(&plan);
                    self.start(apology);
                } else {
                    self.transition(LoopState::Idle);
                }
            }
        }
    }

    fn report(&self, plan: &ActionPlan, status: DispatchStatus, error: Option<StepExecutionError>) {
        let metrics = &self.services.metrics;
        match status {
            DispatchStatus::Completed => metrics.plans_completed.inc(),
            DispatchStatus::Cancelled => metrics.plans_cancelled.inc(),
            DispatchStatus::Failed => metrics.plans_failed.inc(),
            DispatchStatus::Pending | DispatchStatus::Running => {}
        }

        let utterance_id = plan.created_from().map(|id| id.to_string()).unwrap_or_default();
        match (&status, &error) {
            (DispatchStatus::Failed, Some(e)) => error!(
                session_id = %self.session_id,
                plan_id = %plan.id(),
                %utterance_id,
                step_index = e.step_index,
                last_completed = ?e.last_completed,
                error = %e,
                "plan failed"
            ),
            (DispatchStatus::Cancelled, _) => info!(
                session_id = %self.session_id,
                plan_id = %plan.id(),
                %utterance_id,
                "plan cancelled"
            ),
            _ => debug!(session_id = %self.session_id, plan_id = %plan.id(), ?status, "plan finished"),
        }

        self.emit(OrchestratorEvent::PlanFinished {
            session_id: self.session_id.clone(),
            plan_id: plan.id(),
            status,
            error,
        });
    }

    fn on_link_state(&mut self, link: &SessionState) {
        if link.is_connected() {
            if self.state == LoopState::Error {
                info!(session_id = %self.session_id, "robot link restored");
                self.transition(LoopState::Idle);
            }
            if !self.greeted {
                self.greeted = true;
                if let Some(text) = self.services.settings.greeting.clone() {
                    if self.state == LoopState::Idle {
                        let plan = self.services.resolver.greeting_plan(&text);
                        self.start(plan);
                    }
                }
            }
            return;
        }

        if self.state == LoopState::Error {
            return;
        }
        warn!(session_id = %self.session_id, connection = ?link.connection, "robot link unavailable");
        self.transition(LoopState::Error);
        // The in-flight plan is discarded; its task still holds the link until the
        // committed step returns, so nothing new can overlap it.
        if let Some(current) = self.current.take() {
            current.handle.cancel();
            self.finish(current.plan, DispatchStatus::Cancelled, None);
        }
    }

    async fn stop(&mut self) {
        if let Some(current) = self.current.take() {
            current.handle.cancel();
            let plan = current.plan;
            let terminal = current.handle.wait().await;
            let status = terminal.as_ref().map_or(DispatchStatus::Cancelled, |s| s.status);
            self.report(&plan, status, terminal.and_then(|s| s.error));
        }
        self.reminders.clear();
        let leftover = self.interrupts.drain(..).chain(self.queue.drain(..));
        for queued in leftover {
            debug!(session_id = %self.session_id, utterance_id = %queued.id(), "discarding queued utterance at shutdown");
        }
        info!(session_id = %self.session_id, "session worker stopped");
        self.emit(OrchestratorEvent::SessionClosed {
            session_id: self.session_id.clone(),
        });
    }
}

async fn reminder_due(due: Option<OffsetDateTime>) {
    let Some(due) = due else {
        return std::future::pending().await;
    };
    let wait = due - OffsetDateTime::now_utc();
    if wait.is_positive() {
        tokio::time::sleep(wait.unsigned_abs()).await;
    }
}

async fn next_dispatch_state(current: &mut Option<InFlight>) -> Option<DispatchState> {
    match current {
        Some(in_flight) => in_flight.handle.next_state().await,
        None => std::future::pending().await,
    }
}
