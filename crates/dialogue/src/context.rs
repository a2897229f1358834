//! Conversation context and its store
//!
//! Exactly one live [`Context`] exists per conversation session. It is mutated only through
//! [`ContextStore::apply`], which is atomic per session; different sessions never contend on
//! the same lock.

use crate::{ActionPlan, PlanId, Reminder};
use intent_events::Utterance;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info};

/// Reminders kept per session; the oldest is dropped beyond this.
const MAX_REMINDERS: usize = 16;

/// What the conversation is currently about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Greeting,
    Navigation,
    Gesture,
    Information,
    Smalltalk,
    Farewell,
    Clarification,
}

/// A plan held back until the user confirms it.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub plan: Arc<ActionPlan>,
    pub requested_at: Instant,
}

#[derive(Debug, Clone)]
pub struct Context {
    pub session_id: String,
    pub topic: Option<Topic>,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub last_action_id: Option<PlanId>,
    /// Speaking style asked for by the user
    pub tone: Option<String>,
    pub persona: Option<String>,
    reminders: Vec<Reminder>,
    history: VecDeque<Arc<Utterance>>,
    history_limit: usize,
    pub updated_at: Instant,
}

impl Context {
    pub fn new(session_id: impl Into<String>, history_limit: usize) -> Self {
        Self {
            session_id: session_id.into(),
            topic: None,
            pending_confirmation: None,
            last_action_id: None,
            tone: None,
            persona: None,
            reminders: Vec::new(),
            history: VecDeque::with_capacity(history_limit),
            history_limit,
            updated_at: Instant::now(),
        }
    }

    /// Most recent utterances, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Arc<Utterance>> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn last_utterance(&self) -> Option<&Arc<Utterance>> {
        self.history.back()
    }

    /// Append to history, evicting the oldest entries beyond the bound.
    pub fn record(&mut self, utterance: Arc<Utterance>) {
        self.history.push_back(utterance);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    pub fn reminders(&self) -> &[Reminder] {
        &self.reminders
    }

    /// Add a reminder, replacing one with the same time and message.
    pub fn schedule(&mut self, reminder: Reminder) {
        self.reminders
            .retain(|r| !(r.at == reminder.at && r.message == reminder.message));
        self.reminders.push(reminder);
        if self.reminders.len() > MAX_REMINDERS {
            self.reminders.remove(0);
        }
    }

    pub fn next_reminder_due(&self) -> Option<OffsetDateTime> {
        self.reminders.iter().map(|r| r.next_due).min()
    }

    /// Reminders due at `now`, each moved on to its next day.
    pub fn take_due_reminders(&mut self, now: OffsetDateTime) -> Vec<Reminder> {
        let mut due = Vec::new();
        for reminder in self.reminders.iter_mut().filter(|r| r.is_due(now)) {
            due.push(reminder.clone());
            reminder.advance(now);
        }
        due
    }

    /// Untouched for longer than `timeout` with nothing scheduled.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.reminders.is_empty() && self.updated_at.elapsed() > timeout
    }

    /// A fresh conversation for the same session. Tone, persona and reminders carry over.
    pub fn reset(&self) -> Context {
        let mut fresh = Context::new(self.session_id.clone(), self.history_limit);
        fresh.tone = self.tone.clone();
        fresh.persona = self.persona.clone();
        fresh.reminders = self.reminders.clone();
        fresh
    }

    /// Apply a resolver-proposed change.
    pub fn apply_delta(mut self, delta: ContextDelta) -> Context {
        if delta.reset {
            let last_action_id = self.last_action_id;
            self = self.reset();
            self.last_action_id = last_action_id;
        } else {
            if let Some(utterance) = delta.record {
                self.record(utterance);
            }
            if let Some(topic) = delta.topic {
                self.topic = Some(topic);
            }
            match delta.pending {
                PendingChange::Keep => {}
                PendingChange::Clear => self.pending_confirmation = None,
                PendingChange::Set(plan) => {
                    self.pending_confirmation = Some(PendingConfirmation {
                        plan,
                        requested_at: Instant::now(),
                    })
                }
            }
        }

        if let Some(tone) = delta.tone {
            self.tone = Some(tone);
        }
        if let Some(persona) = delta.persona {
            self.persona = Some(persona);
        }
        if delta.clear_reminders {
            self.reminders.clear();
        }
        if let Some(reminder) = delta.reminder {
            self.schedule(reminder);
        }
        if let Some(id) = delta.last_action {
            self.last_action_id = Some(id);
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub enum PendingChange {
    #[default]
    Keep,
    Set(Arc<ActionPlan>),
    Clear,
}

/// Change proposed by the resolver for one utterance.
#[derive(Debug, Clone, Default)]
pub struct ContextDelta {
    pub record: Option<Arc<Utterance>>,
    pub topic: Option<Topic>,
    pub pending: PendingChange,
    pub last_action: Option<PlanId>,
    /// Discard history, topic and pending confirmation
    pub reset: bool,
    pub tone: Option<String>,
    pub persona: Option<String>,
    pub reminder: Option<Reminder>,
    pub clear_reminders: bool,
}

impl ContextDelta {
    pub fn recording(utterance: Arc<Utterance>) -> Self {
        Self {
            record: Some(utterance),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextStoreConfig {
    /// Contexts untouched for longer than this are evicted
    pub idle_timeout: Duration,
    pub history_limit: usize,
    /// Pending confirmations older than this are dropped
    pub confirmation_timeout: Duration,
}

impl Default for ContextStoreConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            history_limit: 10,
            confirmation_timeout: Duration::from_secs(30),
        }
    }
}

struct Slot {
    context: Context,
    /// Set by `sweep` before the slot leaves the map; holders must look it up again
    evicted: bool,
}

pub struct ContextStore {
    config: ContextStoreConfig,
    sessions: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl ContextStore {
    pub fn new(config: ContextStoreConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ContextStoreConfig {
        &self.config
    }

    /// Snapshot of the session's context, created on first access.
    pub fn get(&self, session_id: &str) -> Context {
        self.with_slot(session_id, |ctx| (ctx.clone(), ctx))
    }

    /// Atomically replace the session's context with `transition(context)`.
    pub fn apply(&self, session_id: &str, transition: impl FnOnce(Context) -> Context) -> Context {
        self.apply_with(session_id, |ctx| (transition(ctx), ())).0
    }

    /// Like [`ContextStore::apply`], also handing back a value computed by the transition.
    pub fn apply_with<R>(
        &self,
        session_id: &str,
        transition: impl FnOnce(Context) -> (Context, R),
    ) -> (Context, R) {
        self.with_slot(session_id, |ctx| {
            let (mut next, out) = transition(ctx);
            next.updated_at = Instant::now();
            (next.clone(), (next, out))
        })
    }

    /// Evict every idle context. Returns the ids of the evicted sessions.
    pub fn sweep(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        self.sessions.lock().retain(|session_id, slot| {
            let mut slot = slot.lock();
            if slot.context.is_idle(self.config.idle_timeout) {
                slot.evicted = true;
                info!(session_id = %session_id, "evicting idle conversation context");
                evicted.push(session_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a context exists, without creating one.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Run `f` with exclusive access to the session's context after lazy expiry. `f`
    /// returns the context to store and a value to hand back.
    fn with_slot<R>(&self, session_id: &str, f: impl FnOnce(Context) -> (Context, R)) -> R {
        loop {
            let slot = self
                .sessions
                .lock()
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    debug!(session_id, "creating conversation context");
                    Arc::new(Mutex::new(Slot {
                        context: Context::new(session_id, self.config.history_limit),
                        evicted: false,
                    }))
                })
                .clone();

            let mut guard = slot.lock();
            if guard.evicted {
                // swept between lookup and lock
                continue;
            }
            self.expire(&mut guard.context);
            let (next, out) = f(guard.context.clone());
            guard.context = next;
            return out;
        }
    }

    fn expire(&self, context: &mut Context) {
        if context.updated_at.elapsed() > self.config.idle_timeout {
            info!(session_id = %context.session_id, "conversation idle, resetting context");
            *context = context.reset();
            return;
        }

        let expired = context
            .pending_confirmation
            .as_ref()
            .is_some_and(|p| p.requested_at.elapsed() > self.config.confirmation_timeout);
        if expired {
            if let Some(pending) = context.pending_confirmation.take() {
                info!(
                    session_id = %context.session_id,
                    plan_id = %pending.plan.id(),
                    "pending confirmation expired"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intent_events::{normalize, RawInput};
    use robot_link::ActionStep;
    use std::thread;

    fn utterance(intent: &str) -> Arc<Utterance> {
        Arc::new(normalize(RawInput::new(intent, 0.9)).unwrap())
    }

    fn store(idle_ms: u64, confirm_ms: u64) -> ContextStore {
        ContextStore::new(ContextStoreConfig {
            idle_timeout: Duration::from_millis(idle_ms),
            history_limit: 3,
            confirmation_timeout: Duration::from_millis(confirm_ms),
        })
    }

    #[test]
    fn test_get_creates_default_context() {
        let store = store(10_000, 10_000);
        assert!(!store.contains("s1"));
        let ctx = store.get("s1");
        assert_eq!(ctx.session_id, "s1");
        assert!(ctx.topic.is_none());
        assert!(ctx.pending_confirmation.is_none());
        assert!(store.contains("s1"));
    }

    #[test]
    fn test_history_is_bounded_oldest_first() {
        let store = store(10_000, 10_000);
        let intents = ["a", "b", "c", "d", "e"];
        for intent in intents {
            store.apply("s1", |ctx| ctx.apply_delta(ContextDelta::recording(utterance(intent))));
        }
        let ctx = store.get("s1");
        let kept: Vec<_> = ctx.history().map(|u| u.intent().to_string()).collect();
        assert_eq!(kept, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_idle_context_is_replaced_on_lookup() {
        let store = store(20, 10_000);
        store.apply("s1", |mut ctx| {
            ctx.topic = Some(Topic::Smalltalk);
            ctx.apply_delta(ContextDelta::recording(utterance("greet")))
        });
        thread::sleep(Duration::from_millis(40));

        let ctx = store.get("s1");
        assert!(ctx.topic.is_none());
        assert_eq!(ctx.history_len(), 0);
    }

    #[test]
    fn test_sweep_removes_only_idle_sessions() {
        let store = store(30, 10_000);
        store.get("old");
        thread::sleep(Duration::from_millis(50));
        store.get("fresh");

        assert_eq!(store.sweep(), vec!["old".to_string()]);
        assert!(!store.contains("old"));
        assert!(store.contains("fresh"));
    }

    fn reminder(message: &str, hour: u8) -> Reminder {
        let at = time::Time::from_hms(hour, 0, 0).unwrap();
        // 2024-01-01 14:05:00 UTC
        let from = OffsetDateTime::from_unix_timestamp(1_704_117_900).unwrap();
        Reminder::new(message, at, from)
    }

    #[test]
    fn test_sessions_with_reminders_are_not_swept() {
        let store = store(20, 10_000);
        store.apply("s1", |ctx| {
            ctx.apply_delta(ContextDelta {
                reminder: Some(reminder("stretch", 16)),
                ..ContextDelta::default()
            })
        });
        thread::sleep(Duration::from_millis(40));

        assert!(store.sweep().is_empty());
        let ctx = store.get("s1");
        assert_eq!(ctx.reminders().len(), 1);
    }

    #[test]
    fn test_reset_keeps_settings_and_reminders() {
        let mut ctx = Context::new("s1", 4);
        ctx.record(utterance("greet"));
        let ctx = ctx.apply_delta(ContextDelta {
            tone: Some("cheerful".into()),
            persona: Some("Friendly".into()),
            reminder: Some(reminder("stretch", 16)),
            ..ContextDelta::default()
        });
        let ctx = ctx.apply_delta(ContextDelta {
            reset: true,
            ..ContextDelta::default()
        });
        assert_eq!(ctx.history_len(), 0);
        assert_eq!(ctx.tone.as_deref(), Some("cheerful"));
        assert_eq!(ctx.persona.as_deref(), Some("Friendly"));
        assert_eq!(ctx.reminders().len(), 1);

        let ctx = ctx.apply_delta(ContextDelta {
            clear_reminders: true,
            ..ContextDelta::default()
        });
        assert!(ctx.reminders().is_empty());
        assert!(ctx.next_reminder_due().is_none());
    }

    #[test]
    fn test_due_reminders_are_taken_once_per_day() {
        let mut ctx = Context::new("s1", 4);
        ctx.schedule(reminder("stretch", 16));
        ctx.schedule(reminder("stretch", 16));
        ctx.schedule(reminder("call mum", 20));
        assert_eq!(ctx.reminders().len(), 2);

        let first = ctx.next_reminder_due().unwrap();
        assert_eq!(first.hour(), 16);
        let due = ctx.take_due_reminders(first);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message, "stretch");
        assert!(ctx.take_due_reminders(first).is_empty());
        assert_eq!(ctx.next_reminder_due().map(|t| t.hour()), Some(20));
    }

    #[test]
    fn test_pending_confirmation_expires() {
        let store = store(10_000, 20);
        let plan = Arc::new(ActionPlan::new(
            "move_to",
            vec![ActionStep::move_to("kitchen")],
            crate::Priority::Normal,
            None,
        ));
        store.apply("s1", |ctx| {
            ctx.apply_delta(ContextDelta {
                pending: PendingChange::Set(plan),
                ..ContextDelta::default()
            })
        });
        assert!(store.get("s1").pending_confirmation.is_some());
        thread::sleep(Duration::from_millis(40));
        assert!(store.get("s1").pending_confirmation.is_none());
    }

    #[test]
    fn test_reset_discards_conversation() {
        let ctx = Context::new("s1", 3).apply_delta(ContextDelta {
            record: Some(utterance("greet")),
            topic: Some(Topic::Greeting),
            ..ContextDelta::default()
        });
        let reset = ctx.apply_delta(ContextDelta {
            reset: true,
            ..ContextDelta::default()
        });
        assert_eq!(reset.session_id, "s1");
        assert_eq!(reset.history_len(), 0);
        assert!(reset.topic.is_none());
    }

    #[test]
    fn test_concurrent_applies_do_not_lose_updates() {
        let store = Arc::new(ContextStore::new(ContextStoreConfig {
            history_limit: 1000,
            ..ContextStoreConfig::default()
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        store.apply("shared", |ctx| {
                            ctx.apply_delta(ContextDelta::recording(utterance("tick")))
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("shared").history_len(), 400);
    }
}
