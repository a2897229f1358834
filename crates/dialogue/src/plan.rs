use intent_events::UtteranceId;
use robot_link::{ActionStep, StepCommand};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Interrupt plans preempt whatever is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Interrupt,
}

/// An ordered, immutable sequence of robot steps derived from one utterance.
#[derive(Debug, Clone, Serialize)]
pub struct ActionPlan {
    id: PlanId,
    /// Name of the rule (or built-in response) that produced the plan
    label: String,
    steps: Vec<ActionStep>,
    priority: Priority,
    /// `None` for plans the system starts on its own (greeting, recovery)
    created_from: Option<UtteranceId>,
}

impl ActionPlan {
    pub fn new(
        label: impl Into<String>,
        steps: Vec<ActionStep>,
        priority: Priority,
        created_from: Option<UtteranceId>,
    ) -> Self {
        Self {
            id: PlanId::new(),
            label: label.into(),
            steps,
            priority,
            created_from,
        }
    }

    /// Single spoken sentence.
    pub fn say(label: impl Into<String>, text: impl Into<String>, created_from: Option<UtteranceId>) -> Self {
        Self::new(label, vec![ActionStep::speak(text)], Priority::Normal, created_from)
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_from(&self) -> Option<UtteranceId> {
        self.created_from
    }

    /// Plans with a physical move must be confirmed before they run.
    pub fn is_irreversible(&self) -> bool {
        self.steps.iter().any(|s| s.kind().is_irreversible())
    }

    /// Everything the plan will say, in order.
    pub fn speech(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|s| match &s.command {
            StepCommand::Speak { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}
