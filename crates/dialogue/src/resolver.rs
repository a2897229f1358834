//! Intent-to-plan resolution
//!
//! [`Resolver::resolve`] has no side effects. It reads the utterance and a context snapshot
//! and returns the change the context should undergo together with the plan to dispatch,
//! if any. The caller applies both.

use crate::context::{Context, ContextDelta, PendingChange, Topic};
use crate::reminder::parse_clock;
use crate::rules::{RuleEffect, RuleTable, Selection};
use crate::{ActionPlan, Priority, Reminder};
use intent_events::{intents, Utterance};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const REPEAT_PROMPT: &str = "Sorry, I didn't catch that. Could you say it again?";
const YES_NO_PROMPT: &str = "Sorry, was that a yes or a no?";
const FALLBACK_REPLY: &str = "I'm not sure how to respond to that.";
const DEFAULT_CONFIRMATION: &str = "Should I go ahead? Please confirm.";
const APOLOGY: &str = "Sorry, I couldn't finish that.";
const TONE_PROMPT: &str = "What tone would you like me to use?";
const REMINDER_PROMPT: &str = "To set a reminder, I need the reminder text and a specific time.";
const CLOCK_PROMPT: &str = "Sorry, I need the time as hours and minutes, like 18:30.";

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// Utterances below this confidence are answered with a request to repeat
    pub confidence_threshold: f32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
        }
    }
}

/// Result of resolving one utterance.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub delta: ContextDelta,
    pub plan: Option<Arc<ActionPlan>>,
}

impl Resolution {
    fn dispatch(mut delta: ContextDelta, plan: ActionPlan) -> Self {
        let plan = Arc::new(plan);
        delta.last_action = Some(plan.id());
        Self {
            delta,
            plan: Some(plan),
        }
    }

    fn nothing(delta: ContextDelta) -> Self {
        Self { delta, plan: None }
    }
}

#[derive(Debug, Clone)]
pub struct Resolver {
    rules: Arc<RuleTable>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(rules: Arc<RuleTable>, config: ResolverConfig) -> Self {
        Self { rules, config }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn config(&self) -> ResolverConfig {
        self.config
    }

    fn confident(&self, utterance: &Utterance) -> bool {
        utterance.confidence() >= self.config.confidence_threshold
    }

    /// Priority the utterance will resolve to, known before the context is touched.
    ///
    /// The orchestrator uses this to decide whether to preempt the running plan.
    pub fn classify(&self, utterance: &Utterance) -> Priority {
        if !self.confident(utterance) {
            return Priority::Normal;
        }
        match self.rules.select(utterance) {
            Selection::Matched { rule, .. } | Selection::MissingSlot { rule, .. } => rule.priority,
            Selection::Unmatched => Priority::Normal,
        }
    }

    pub fn resolve(&self, utterance: &Arc<Utterance>, context: &Context) -> Resolution {
        let mut delta = ContextDelta::recording(utterance.clone());
        let source = Some(utterance.id());
        let confident = self.confident(utterance);

        if let Some(pending) = &context.pending_confirmation {
            let confirm = utterance.is_intent(intents::CONFIRM);
            if confirm || utterance.is_intent(intents::DENY) {
                if !confident {
                    delta.topic = Some(Topic::Clarification);
                    return Resolution::dispatch(delta, ActionPlan::say("clarify", YES_NO_PROMPT, source));
                }
                delta.pending = PendingChange::Clear;
                if confirm {
                    info!(
                        session_id = %context.session_id,
                        utterance_id = %utterance.id(),
                        plan_id = %pending.plan.id(),
                        "pending plan confirmed"
                    );
                    delta.last_action = Some(pending.plan.id());
                    return Resolution {
                        delta,
                        plan: Some(pending.plan.clone()),
                    };
                }
                info!(
                    session_id = %context.session_id,
                    utterance_id = %utterance.id(),
                    plan_id = %pending.plan.id(),
                    "pending plan discarded"
                );
                return Resolution::nothing(delta);
            }
        }

        if !confident {
            debug!(
                utterance_id = %utterance.id(),
                confidence = utterance.confidence(),
                "below confidence threshold, asking to repeat"
            );
            delta.topic = Some(Topic::Clarification);
            return Resolution::dispatch(delta, ActionPlan::say("clarify", REPEAT_PROMPT, source));
        }

        match self.rules.select(utterance) {
            Selection::Unmatched => {
                debug!(utterance_id = %utterance.id(), intent = utterance.intent(), "no rule for intent");
                Resolution::dispatch(delta, ActionPlan::say("fallback", FALLBACK_REPLY, source))
            }
            Selection::MissingSlot { rule, slot } => {
                let question = match rule.slot_prompts.get(slot) {
                    Some(prompt) => self.rules.render(prompt, &HashMap::new()),
                    None => format!("Could you tell me the {slot}?"),
                };
                delta.topic = Some(Topic::Clarification);
                Resolution::dispatch(
                    delta,
                    ActionPlan::say(format!("clarify:{}", rule.name), question, source),
                )
            }
            Selection::Matched { rule, slots } => {
                if let Some(effect) = &rule.effect {
                    if let Err(reply) = self.effect_delta(effect, &slots, utterance, &mut delta) {
                        delta.topic = Some(Topic::Clarification);
                        return Resolution::dispatch(
                            delta,
                            ActionPlan::say(format!("clarify:{}", rule.name), reply, source),
                        );
                    }
                }
                let plan = ActionPlan::new(
                    rule.name.clone(),
                    self.rules.build_steps(rule, &slots),
                    rule.priority,
                    source,
                );
                delta.topic = rule.topic;
                delta.reset = rule.resets_context;

                if plan.is_irreversible() {
                    let question = rule
                        .confirmation_prompt
                        .as_deref()
                        .map_or_else(|| DEFAULT_CONFIRMATION.to_string(), |p| self.rules.render(p, &slots));
                    info!(
                        utterance_id = %utterance.id(),
                        plan_id = %plan.id(),
                        rule = %rule.name,
                        "irreversible plan held for confirmation"
                    );
                    delta.pending = PendingChange::Set(Arc::new(plan));
                    return Resolution::dispatch(
                        delta,
                        ActionPlan::say(format!("confirm:{}", rule.name), question, source),
                    );
                }
                Resolution::dispatch(delta, plan)
            }
        }
    }

    /// Record what the effect changes in `delta`, or return what to say instead.
    fn effect_delta(
        &self,
        effect: &RuleEffect,
        slots: &HashMap<String, String>,
        utterance: &Utterance,
        delta: &mut ContextDelta,
    ) -> Result<(), String> {
        match effect {
            RuleEffect::SetTone { tone } => {
                let tone = self.rules.render(tone, slots).trim().to_string();
                if tone.is_empty() {
                    return Err(TONE_PROMPT.to_string());
                }
                info!(utterance_id = %utterance.id(), %tone, "tone changed");
                delta.tone = Some(tone);
            }
            RuleEffect::SetPersona { persona } => {
                let name = self.rules.render(persona, slots);
                let Some(found) = self.rules.persona(&name) else {
                    let available: Vec<&str> = self.rules.personas().iter().map(|p| p.name.as_str()).collect();
                    return Err(format!(
                        "Sorry, I don't have a personality named '{}'. Available: {}.",
                        name.trim(),
                        available.join(", ")
                    ));
                };
                info!(utterance_id = %utterance.id(), persona = %found, "persona changed");
                delta.persona = Some(found.name.clone());
                delta.tone = Some(found.tone.clone());
            }
            RuleEffect::Remind { message, at } => {
                let message = self.rules.render(message, slots).trim().to_string();
                if message.is_empty() {
                    return Err(REMINDER_PROMPT.to_string());
                }
                let Some(at) = parse_clock(&self.rules.render(at, slots)) else {
                    return Err(CLOCK_PROMPT.to_string());
                };
                let reminder = Reminder::new(message, at, utterance.timestamp());
                info!(utterance_id = %utterance.id(), next_due = %reminder.next_due, "reminder scheduled");
                delta.reminder = Some(reminder);
            }
            RuleEffect::ClearReminders => delta.clear_reminders = true,
        }
        Ok(())
    }

    /// Spoken when a reminder comes due.
    pub fn reminder_plan(&self, reminder: &Reminder) -> Arc<ActionPlan> {
        Arc::new(ActionPlan::say("reminder", reminder.spoken(), None))
    }

    /// Spoken after a plan fails part way through.
    pub fn apology_plan(&self, failed: &ActionPlan) -> Arc<ActionPlan> {
        Arc::new(ActionPlan::say("apology", APOLOGY, failed.created_from()))
    }

    pub fn greeting_plan(&self, text: &str) -> Arc<ActionPlan> {
        Arc::new(ActionPlan::say("greeting", text, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextStore, ContextStoreConfig};
    use intent_events::{normalize, RawInput};
    use robot_link::{StepCommand, StepKind};

    fn resolver() -> Resolver {
        Resolver::new(Arc::new(RuleTable::builtin().unwrap()), ResolverConfig::default())
    }

    fn utter(raw: RawInput) -> Arc<Utterance> {
        Arc::new(normalize(raw).unwrap())
    }

    /// Resolve against the store the way the orchestrator does.
    fn step(store: &ContextStore, resolver: &Resolver, u: Arc<Utterance>) -> Option<Arc<ActionPlan>> {
        let (_, plan) = store.apply_with("s1", |ctx| {
            let resolution = resolver.resolve(&u, &ctx);
            (ctx.apply_delta(resolution.delta), resolution.plan)
        });
        plan
    }

    #[test]
    fn test_greet_yields_single_speak_step() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();
        let plan = step(&store, &r, utter(RawInput::new("greet", 0.95))).unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[0].kind(), StepKind::Speak);
        let ctx = store.get("s1");
        assert!(ctx.pending_confirmation.is_none());
        assert_eq!(ctx.topic, Some(Topic::Greeting));
        assert_eq!(ctx.last_action_id, Some(plan.id()));
    }

    #[test]
    fn test_move_requires_confirmation_then_dispatches_same_plan() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();

        let prompt = step(
            &store,
            &r,
            utter(RawInput::new("move_to", 0.9).with_entity("room", "kitchen")),
        )
        .unwrap();
        assert!(!prompt.is_irreversible());
        assert_eq!(prompt.speech().next(), Some("Should I go to the kitchen? Please confirm."));

        let pending = store.get("s1").pending_confirmation.unwrap().plan;
        assert!(pending.is_irreversible());

        let confirmed = step(&store, &r, utter(RawInput::new("confirm", 0.9))).unwrap();
        assert_eq!(confirmed.id(), pending.id());
        assert!(confirmed
            .steps()
            .iter()
            .any(|s| s.command == StepCommand::Move { target: "kitchen".into() }));
        assert!(store.get("s1").pending_confirmation.is_none());
    }

    #[test]
    fn test_deny_discards_pending_plan() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();
        step(
            &store,
            &r,
            utter(RawInput::new("move_to", 0.9).with_entity("room", "kitchen")),
        );
        assert!(store.get("s1").pending_confirmation.is_some());

        let plan = step(&store, &r, utter(RawInput::new("deny", 0.9)));
        assert!(plan.is_none());
        assert!(store.get("s1").pending_confirmation.is_none());
    }

    #[test]
    fn test_unsure_confirmation_keeps_pending() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();
        step(
            &store,
            &r,
            utter(RawInput::new("move_to", 0.9).with_entity("room", "kitchen")),
        );
        let plan = step(&store, &r, utter(RawInput::new("confirm", 0.3))).unwrap();
        assert!(!plan.is_irreversible());
        assert_eq!(plan.label(), "clarify");
        assert!(store.get("s1").pending_confirmation.is_some());
    }

    #[test]
    fn test_low_confidence_always_yields_clarify() {
        let r = resolver();
        let ctx = Context::new("s1", 10);
        for intent in ["greet", "something_unknown", "move_to"] {
            let resolution = r.resolve(&utter(RawInput::new(intent, 0.2)), &ctx);
            let plan = resolution.plan.unwrap();
            assert_eq!(plan.label(), "clarify");
            assert_eq!(plan.speech().next(), Some(REPEAT_PROMPT));
        }
    }

    #[test]
    fn test_unknown_intent_gets_fallback() {
        let r = resolver();
        let ctx = Context::new("s1", 10);
        let plan = r.resolve(&utter(RawInput::new("sing", 0.9)), &ctx).plan.unwrap();
        assert_eq!(plan.speech().next(), Some(FALLBACK_REPLY));
    }

    #[test]
    fn test_missing_slot_asks_for_it() {
        let r = resolver();
        let ctx = Context::new("s1", 10);
        let resolution = r.resolve(&utter(RawInput::new("move_to", 0.9)), &ctx);
        let plan = resolution.plan.unwrap();
        assert_eq!(plan.speech().next(), Some("Where should I go?"));
        assert!(matches!(resolution.delta.pending, PendingChange::Keep));
        assert_eq!(resolution.delta.topic, Some(Topic::Clarification));
    }

    #[test]
    fn test_classify_interrupt() {
        let r = resolver();
        assert_eq!(r.classify(&utter(RawInput::new("stop", 0.9))), Priority::Interrupt);
        assert_eq!(r.classify(&utter(RawInput::new("stop", 0.1))), Priority::Normal);
        assert_eq!(r.classify(&utter(RawInput::new("greet", 0.9))), Priority::Normal);
    }

    #[test]
    fn test_farewell_resets_context() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();
        step(&store, &r, utter(RawInput::new("greet", 0.9)));
        step(
            &store,
            &r,
            utter(RawInput::new("move_to", 0.9).with_entity("room", "hall")),
        );
        let plan = step(&store, &r, utter(RawInput::new("farewell", 0.9))).unwrap();
        let ctx = store.get("s1");
        assert_eq!(ctx.history_len(), 0);
        assert!(ctx.pending_confirmation.is_none());
        assert!(ctx.topic.is_none());
        assert_eq!(ctx.last_action_id, Some(plan.id()));
    }

    #[test]
    fn test_time_answer_uses_utterance_timestamp() {
        let r = resolver();
        let ctx = Context::new("s1", 10);
        let mut raw = RawInput::new("tell_time", 0.9);
        // 2024-01-01 14:05:00 UTC
        raw.timestamp = Some(time::OffsetDateTime::from_unix_timestamp(1_704_117_900).unwrap());
        let plan = r.resolve(&utter(raw), &ctx).plan.unwrap();
        assert_eq!(plan.speech().next(), Some("It is 14:05."));
    }

    #[test]
    fn test_apology_keeps_source() {
        let r = resolver();
        let u = utter(RawInput::new("nod", 0.9));
        let plan = r.resolve(&u, &Context::new("s1", 10)).plan.unwrap();
        let apology = r.apology_plan(&plan);
        assert_eq!(apology.created_from(), Some(u.id()));
        assert!(r.greeting_plan("Hello").created_from().is_none());
    }

    fn at_afternoon(raw: RawInput) -> Arc<Utterance> {
        let mut raw = raw;
        // 2024-01-01 14:05:00 UTC
        raw.timestamp = Some(time::OffsetDateTime::from_unix_timestamp(1_704_117_900).unwrap());
        utter(raw)
    }

    #[test]
    fn test_tone_is_remembered() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();
        let plan = step(
            &store,
            &r,
            utter(RawInput::new("change_tone", 0.9).with_entity("tone", "cheerful")),
        )
        .unwrap();
        assert_eq!(plan.speech().next(), Some("Alright, I'll try to adopt a cheerful tone."));
        assert_eq!(store.get("s1").tone.as_deref(), Some("cheerful"));

        let ask = step(&store, &r, utter(RawInput::new("change_tone", 0.9))).unwrap();
        assert_eq!(ask.speech().next(), Some(TONE_PROMPT));
        assert_eq!(store.get("s1").tone.as_deref(), Some("cheerful"));
    }

    #[test]
    fn test_persona_switch_adopts_its_tone() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();
        step(
            &store,
            &r,
            utter(RawInput::new("change_personality", 0.9).with_entity("persona", "playful")),
        );
        let ctx = store.get("s1");
        assert_eq!(ctx.persona.as_deref(), Some("Playful"));
        assert_eq!(ctx.tone.as_deref(), Some("humorous"));

        let refused = step(
            &store,
            &r,
            utter(RawInput::new("change_personality", 0.9).with_entity("persona", "grumpy")),
        )
        .unwrap();
        assert_eq!(
            refused.speech().next(),
            Some("Sorry, I don't have a personality named 'grumpy'. Available: Friendly, Professional, Playful.")
        );
        assert_eq!(store.get("s1").persona.as_deref(), Some("Playful"));
    }

    #[test]
    fn test_reminder_is_scheduled_from_utterance_time() {
        let store = ContextStore::new(ContextStoreConfig::default());
        let r = resolver();
        let u = at_afternoon(
            RawInput::new("set_reminder", 0.9)
                .with_entity("note", "take your pills")
                .with_entity("at", "18:30"),
        );
        let plan = step(&store, &r, u.clone()).unwrap();
        assert_eq!(
            plan.speech().next(),
            Some("Okay, I'll remind you every day at 18:30: take your pills.")
        );

        let ctx = store.get("s1");
        let reminder = &ctx.reminders()[0];
        assert_eq!(reminder.message, "take your pills");
        assert_eq!(reminder.next_due.date(), u.timestamp().date());
        assert_eq!((reminder.next_due.hour(), reminder.next_due.minute()), (18, 30));

        let spoken = r.reminder_plan(reminder);
        assert_eq!(spoken.speech().next(), Some("Reminder: take your pills"));
        assert!(spoken.created_from().is_none());

        step(&store, &r, utter(RawInput::new("cancel_reminder", 0.9)));
        assert!(store.get("s1").reminders().is_empty());
    }

    #[test]
    fn test_reminder_needs_a_clock_time() {
        let r = resolver();
        let ctx = Context::new("s1", 10);
        let resolution = r.resolve(
            &at_afternoon(
                RawInput::new("set_reminder", 0.9)
                    .with_entity("note", "call mum")
                    .with_entity("at", "after lunch"),
            ),
            &ctx,
        );
        assert_eq!(resolution.plan.unwrap().speech().next(), Some(CLOCK_PROMPT));
        assert!(resolution.delta.reminder.is_none());

        let missing = r.resolve(&utter(RawInput::new("set_reminder", 0.9).with_entity("note", "call mum")), &ctx);
        assert_eq!(
            missing.plan.unwrap().speech().next(),
            Some("At what time should I remind you?")
        );
    }

    #[test]
    fn test_head_touch_gets_a_reply() {
        let r = resolver();
        let plan = r
            .resolve(&utter(RawInput::new("head_touched", 1.0)), &Context::new("s1", 10))
            .plan
            .unwrap();
        assert_eq!(plan.speech().next(), Some("Please don't touch my head."));
    }
}
