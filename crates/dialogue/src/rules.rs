//! Intent rule table
//!
//! Rules map an intent to a plan template. A rule declares the entity slots it needs;
//! when several rules share an intent, the one with more required slots is tried first.
//! Two rules for the same intent with the same number of required slots have no defined
//! winner, so [`RuleTable::new`] rejects them.
//!
//! Besides its reply, a rule may carry a [`RuleEffect`] that changes what the context
//! remembers: the speaking tone, the active persona or the session's reminders.

use crate::{Priority, RuleLoadError, RuleTableError, Topic};
use intent_events::{intents, Utterance};
use regex::Regex;
use robot_link::{ActionStep, StepCommand};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

/// Slots every rule can use without declaring them; filled from the utterance timestamp.
const BUILTIN_SLOTS: [&str; 2] = ["time", "date"];

/// One step of a plan template. String fields may contain `{slot}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    #[serde(flatten)]
    pub command: StepCommand,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default = "default_cancellable")]
    pub cancellable: bool,
}

fn default_cancellable() -> bool {
    true
}

impl StepTemplate {
    fn from_command(command: StepCommand) -> Self {
        Self {
            command,
            duration_ms: None,
            cancellable: true,
        }
    }

    pub fn speak(text: &str) -> Self {
        Self::from_command(StepCommand::Speak {
            text: text.to_string(),
            animated: true,
        })
    }

    pub fn gesture(animation: &str) -> Self {
        Self::from_command(StepCommand::Gesture {
            animation: animation.to_string(),
        })
    }

    pub fn move_to(target: &str) -> Self {
        Self::from_command(StepCommand::Move {
            target: target.to_string(),
        })
    }

    pub fn non_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    fn texts(&self) -> Vec<&str> {
        match &self.command {
            StepCommand::Speak { text, .. } => vec![text],
            StepCommand::Gesture { animation } => vec![animation],
            StepCommand::Move { target } => vec![target],
            StepCommand::Wait => Vec::new(),
        }
    }
}

/// Context change a rule makes in addition to its steps. Fields are `{slot}` templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleEffect {
    SetTone { tone: String },
    /// Switch to a persona declared in the table; also adopts its tone
    SetPersona { persona: String },
    /// Speak `message` every day at `at` (`HH:MM`)
    Remind { message: String, at: String },
    ClearReminders,
}

impl RuleEffect {
    fn texts(&self) -> Vec<&str> {
        match self {
            RuleEffect::SetTone { tone } => vec![tone],
            RuleEffect::SetPersona { persona } => vec![persona],
            RuleEffect::Remind { message, at } => vec![message, at],
            RuleEffect::ClearReminders => Vec::new(),
        }
    }
}

/// A named personality and the tone it speaks in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub tone: String,
}

impl Persona {
    pub fn new(name: &str, tone: &str) -> Self {
        Self {
            name: name.to_string(),
            tone: tone.to_string(),
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRule {
    pub name: String,
    pub intent: String,
    #[serde(default)]
    pub required_slots: Vec<String>,
    /// Optional slots and the value used when the utterance does not carry them
    #[serde(default)]
    pub optional_slots: BTreeMap<String, String>,
    /// Question asked when a required slot is missing
    #[serde(default)]
    pub slot_prompts: BTreeMap<String, String>,
    #[serde(default)]
    pub topic: Option<Topic>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub resets_context: bool,
    /// Question asked before an irreversible plan runs
    #[serde(default)]
    pub confirmation_prompt: Option<String>,
    #[serde(default)]
    pub effect: Option<RuleEffect>,
    pub steps: Vec<StepTemplate>,
}

impl IntentRule {
    pub fn new(name: &str, intent: &str, steps: Vec<StepTemplate>) -> Self {
        Self {
            name: name.to_string(),
            intent: intent.to_string(),
            required_slots: Vec::new(),
            optional_slots: BTreeMap::new(),
            slot_prompts: BTreeMap::new(),
            topic: None,
            priority: Priority::Normal,
            resets_context: false,
            confirmation_prompt: None,
            effect: None,
            steps,
        }
    }

    pub fn requires(mut self, slot: &str, prompt: &str) -> Self {
        self.required_slots.push(slot.to_string());
        self.slot_prompts.insert(slot.to_string(), prompt.to_string());
        self
    }

    pub fn optional(mut self, slot: &str, default: &str) -> Self {
        self.optional_slots.insert(slot.to_string(), default.to_string());
        self
    }

    pub fn topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn interrupt(mut self) -> Self {
        self.priority = Priority::Interrupt;
        self
    }

    pub fn resets_context(mut self) -> Self {
        self.resets_context = true;
        self
    }

    pub fn confirm_with(mut self, prompt: &str) -> Self {
        self.confirmation_prompt = Some(prompt.to_string());
        self
    }

    pub fn effect(mut self, effect: RuleEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    /// Number of required slots; higher wins among rules for the same intent.
    pub fn specificity(&self) -> usize {
        self.required_slots.len()
    }

    fn declares(&self, slot: &str) -> bool {
        self.required_slots.iter().any(|s| s == slot)
            || self.optional_slots.contains_key(slot)
            || BUILTIN_SLOTS.contains(&slot)
    }

    fn templates(&self) -> impl Iterator<Item = &str> {
        self.steps
            .iter()
            .flat_map(|s| s.texts())
            .chain(self.confirmation_prompt.as_deref())
            .chain(self.slot_prompts.values().map(String::as_str))
            .chain(self.effect.iter().flat_map(RuleEffect::texts))
    }
}

/// Outcome of looking an utterance up in the table.
#[derive(Debug)]
pub enum Selection<'a> {
    Matched {
        rule: &'a IntentRule,
        slots: HashMap<String, String>,
    },
    MissingSlot {
        rule: &'a IntentRule,
        slot: &'a str,
    },
    Unmatched,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<IntentRule>,
    #[serde(default)]
    personas: Vec<Persona>,
}

/// Validated, immutable rule table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<IntentRule>,
    /// Rule indices per intent, most specific first
    by_intent: HashMap<String, Vec<usize>>,
    personas: Vec<Persona>,
    placeholder: Regex,
}

impl RuleTable {
    pub fn new(mut rules: Vec<IntentRule>) -> Result<Self, RuleTableError> {
        let placeholder = Regex::new(r"\{([a-z_][a-z0-9_]*)\}")?;
        let mut names = HashSet::new();
        let mut by_intent: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (index, rule) in rules.iter_mut().enumerate() {
            rule.intent = rule.intent.trim().to_lowercase();
            rule.required_slots = rule
                .required_slots
                .iter()
                .map(|s| s.trim().to_lowercase())
                .collect();

            if !names.insert(rule.name.clone()) {
                return Err(RuleTableError::DuplicateName(rule.name.clone()));
            }
            if rule.intent.is_empty() {
                return Err(RuleTableError::EmptyIntent {
                    rule: rule.name.clone(),
                });
            }
            if rule.steps.is_empty() {
                return Err(RuleTableError::NoSteps {
                    rule: rule.name.clone(),
                });
            }
            for template in rule.templates() {
                for caps in placeholder.captures_iter(template) {
                    let slot = caps.get(1).map_or("", |m| m.as_str());
                    if !rule.declares(slot) {
                        return Err(RuleTableError::UndeclaredSlot {
                            rule: rule.name.clone(),
                            slot: slot.to_string(),
                        });
                    }
                }
            }
            by_intent.entry(rule.intent.clone()).or_default().push(index);
        }

        for (intent, indices) in by_intent.iter_mut() {
            indices.sort_by_key(|&i| Reverse(rules[i].specificity()));
            for pair in indices.windows(2) {
                let (first, second) = (&rules[pair[0]], &rules[pair[1]]);
                if first.specificity() == second.specificity() {
                    return Err(RuleTableError::Ambiguous {
                        intent: intent.clone(),
                        first: first.name.clone(),
                        second: second.name.clone(),
                        specificity: first.specificity(),
                    });
                }
            }
        }

        Ok(Self {
            rules,
            by_intent: by_intent.into_iter().collect(),
            personas: Vec::new(),
            placeholder,
        })
    }

    /// Declare the personas `set_persona` effects may switch to. Names are case-insensitive.
    pub fn with_personas(mut self, personas: Vec<Persona>) -> Result<Self, RuleTableError> {
        let mut names = HashSet::new();
        for persona in &personas {
            if !names.insert(persona.name.to_lowercase()) {
                return Err(RuleTableError::DuplicatePersona(persona.name.clone()));
            }
        }
        self.personas = personas;
        Ok(self)
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn persona(&self, name: &str) -> Option<&Persona> {
        let name = name.trim();
        self.personas.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// The table the daemon serves with when no rule file is configured.
    pub fn builtin() -> Result<Self, RuleTableError> {
        Self::new(vec![
            IntentRule::new("greet", "greet", vec![StepTemplate::speak("Hello! How can I help you?")])
                .topic(Topic::Greeting),
            IntentRule::new(
                "farewell",
                "farewell",
                vec![
                    StepTemplate::speak("Goodbye! It was nice talking to you."),
                    StepTemplate::gesture("Wave"),
                ],
            )
            .topic(Topic::Farewell)
            .resets_context(),
            IntentRule::new(
                "end_conversation",
                intents::END_CONVERSATION,
                vec![StepTemplate::speak("Okay, talk to you later.")],
            )
            .resets_context(),
            IntentRule::new("tell_time", "tell_time", vec![StepTemplate::speak("It is {time}.")])
                .topic(Topic::Information),
            IntentRule::new("tell_date", "tell_date", vec![StepTemplate::speak("Today is {date}.")])
                .topic(Topic::Information),
            IntentRule::new(
                "move_to_room",
                "move_to",
                vec![
                    StepTemplate::speak("Heading to the {room}."),
                    StepTemplate::move_to("{room}"),
                ],
            )
            .requires("room", "Where should I go?")
            .confirm_with("Should I go to the {room}? Please confirm.")
            .topic(Topic::Navigation),
            IntentRule::new(
                "go_to_posture",
                "go_to_posture",
                vec![StepTemplate::move_to("posture/{posture}")],
            )
            .requires("posture", "Which posture should I take?")
            .confirm_with("Should I change to the {posture} posture?")
            .topic(Topic::Gesture),
            IntentRule::new(
                "nod",
                "nod",
                vec![StepTemplate::gesture("{animation}")],
            )
            .optional("animation", "HeadNod")
            .topic(Topic::Gesture),
            IntentRule::new(
                "stop",
                "stop",
                vec![StepTemplate::speak("Okay, stopping.").non_cancellable()],
            )
            .interrupt(),
            IntentRule::new(
                "help",
                "help",
                vec![StepTemplate::speak(
                    "You can ask me the time or the date, ask me to go to a room, set a reminder, or say stop.",
                )],
            )
            .topic(Topic::Information),
            IntentRule::new(
                "change_tone",
                "change_tone",
                vec![StepTemplate::speak("Alright, I'll try to adopt a {tone} tone.")],
            )
            .requires("tone", "What tone would you like me to use?")
            .effect(RuleEffect::SetTone { tone: "{tone}".into() })
            .topic(Topic::Smalltalk),
            IntentRule::new(
                "change_personality",
                "change_personality",
                vec![StepTemplate::speak("Okay, I've switched my personality to {persona}.")],
            )
            .requires("persona", "Which personality should I use?")
            .effect(RuleEffect::SetPersona {
                persona: "{persona}".into(),
            })
            .topic(Topic::Smalltalk),
            IntentRule::new(
                "set_reminder",
                "set_reminder",
                vec![StepTemplate::speak("Okay, I'll remind you every day at {at}: {note}.")],
            )
            .requires("note", "What should I remind you about?")
            .requires("at", "At what time should I remind you?")
            .effect(RuleEffect::Remind {
                message: "{note}".into(),
                at: "{at}".into(),
            })
            .topic(Topic::Information),
            IntentRule::new(
                "cancel_reminders",
                "cancel_reminder",
                vec![StepTemplate::speak("Okay, I've cancelled your reminders.")],
            )
            .effect(RuleEffect::ClearReminders)
            .topic(Topic::Information),
            IntentRule::new(
                "head_touched",
                "head_touched",
                vec![StepTemplate::speak("Please don't touch my head.")],
            ),
        ])?
        .with_personas(vec![
            Persona::new("Friendly", "cheerful"),
            Persona::new("Professional", "formal"),
            Persona::new("Playful", "humorous"),
        ])
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, RuleLoadError> {
        let file: RuleFile = serde_yaml::from_str(raw)?;
        Ok(Self::new(file.rules)?.with_personas(file.personas)?)
    }

    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self, RuleLoadError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| RuleLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn rules(&self) -> &[IntentRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Pick the most specific rule whose required slots the utterance fills.
    pub fn select<'a>(&'a self, utterance: &Utterance) -> Selection<'a> {
        let Some(indices) = self.by_intent.get(utterance.intent()) else {
            return Selection::Unmatched;
        };

        for &index in indices {
            let rule = &self.rules[index];
            if let Some(slots) = bind_slots(rule, utterance) {
                return Selection::Matched { rule, slots };
            }
        }

        // Nothing bound: ask for what the least demanding candidate is missing.
        let Some(rule) = indices.last().map(|&i| &self.rules[i]) else {
            return Selection::Unmatched;
        };
        match rule
            .required_slots
            .iter()
            .find(|slot| utterance.entity(slot).is_none())
        {
            Some(slot) => Selection::MissingSlot { rule, slot },
            None => Selection::Unmatched,
        }
    }

    /// Replace `{slot}` placeholders. Unknown slots render empty.
    pub fn render(&self, template: &str, slots: &HashMap<String, String>) -> String {
        self.placeholder
            .replace_all(template, |caps: &regex::Captures<'_>| {
                caps.get(1)
                    .and_then(|m| slots.get(m.as_str()))
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned()
    }

    /// Instantiate a rule's step templates.
    pub fn build_steps(&self, rule: &IntentRule, slots: &HashMap<String, String>) -> Vec<ActionStep> {
        rule.steps
            .iter()
            .map(|template| {
                let mut step = match &template.command {
                    StepCommand::Speak { text, animated } => {
                        let mut step = ActionStep::speak(self.render(text, slots));
                        if let StepCommand::Speak { animated: a, .. } = &mut step.command {
                            *a = *animated;
                        }
                        step
                    }
                    StepCommand::Gesture { animation } => {
                        ActionStep::gesture(self.render(animation, slots))
                    }
                    StepCommand::Move { target } => ActionStep::move_to(self.render(target, slots)),
                    StepCommand::Wait => ActionStep::wait(Duration::from_secs(1)),
                };
                if let Some(ms) = template.duration_ms {
                    step.expected_duration = Duration::from_millis(ms);
                }
                step.cancellable = template.cancellable;
                step
            })
            .collect()
    }
}

fn bind_slots(rule: &IntentRule, utterance: &Utterance) -> Option<HashMap<String, String>> {
    let mut slots = HashMap::new();
    for slot in &rule.required_slots {
        let entity = utterance.entity(slot)?;
        slots.insert(slot.clone(), entity.value.clone());
    }
    for (slot, default) in &rule.optional_slots {
        let value = utterance
            .entity(slot)
            .map_or_else(|| default.clone(), |e| e.value.clone());
        slots.insert(slot.clone(), value);
    }
    let ts = utterance.timestamp();
    slots.insert("time".to_string(), spoken_time(ts));
    slots.insert("date".to_string(), spoken_date(ts));
    Some(slots)
}

fn spoken_time(ts: OffsetDateTime) -> String {
    format!("{:02}:{:02}", ts.hour(), ts.minute())
}

fn spoken_date(ts: OffsetDateTime) -> String {
    format!("{}, {} {}, {}", ts.weekday(), ts.month(), ts.day(), ts.year())
}
