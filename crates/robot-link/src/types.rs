use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Coarse classification of a step, used for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Speak,
    Gesture,
    Move,
    Wait,
}

impl StepKind {
    /// Physical relocation cannot be undone by the robot, every other kind can be abandoned.
    pub fn is_irreversible(self) -> bool {
        matches!(self, StepKind::Move)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Speak => write!(f, "speak"),
            StepKind::Gesture => write!(f, "gesture"),
            StepKind::Move => write!(f, "move"),
            StepKind::Wait => write!(f, "wait"),
        }
    }
}

/// Payload of a step. The variant determines the [`StepKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepCommand {
    /// Say `text`, optionally with the platform's contextual body animation
    Speak {
        text: String,
        #[serde(default = "default_animated")]
        animated: bool,
    },
    /// Play a named body-language animation (e.g. `Joy`, `Think`, `HeadNod`)
    Gesture { animation: String },
    /// Move to a named location or posture
    Move { target: String },
    /// Hold still
    Wait,
}

fn default_animated() -> bool {
    true
}

impl StepCommand {
    pub fn kind(&self) -> StepKind {
        match self {
            StepCommand::Speak { .. } => StepKind::Speak,
            StepCommand::Gesture { .. } => StepKind::Gesture,
            StepCommand::Move { .. } => StepKind::Move,
            StepCommand::Wait => StepKind::Wait,
        }
    }
}

/// One executable robot command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStep {
    pub command: StepCommand,
    /// How long the hardware is expected to take; the dispatcher derives its timeout from it
    pub expected_duration: Duration,
    /// Whether a pending cancellation may skip this step at a step boundary
    pub cancellable: bool,
}

impl ActionStep {
    pub fn new(command: StepCommand, expected_duration: Duration) -> Self {
        Self {
            command,
            expected_duration,
            cancellable: true,
        }
    }

    pub fn speak(text: impl Into<String>) -> Self {
        let text = text.into();
        // Roughly 15 characters per second of speech, never less than a second.
        let secs = (text.chars().count() as u64 / 15).max(1);
        Self::new(
            StepCommand::Speak {
                text,
                animated: true,
            },
            Duration::from_secs(secs),
        )
    }

    pub fn gesture(animation: impl Into<String>) -> Self {
        Self::new(
            StepCommand::Gesture {
                animation: animation.into(),
            },
            Duration::from_secs(2),
        )
    }

    pub fn move_to(target: impl Into<String>) -> Self {
        Self::new(
            StepCommand::Move {
                target: target.into(),
            },
            Duration::from_secs(10),
        )
    }

    pub fn wait(duration: Duration) -> Self {
        Self::new(StepCommand::Wait, duration)
    }

    pub fn non_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    pub fn kind(&self) -> StepKind {
        self.command.kind()
    }
}

/// Outcome reported by the robot for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    Timeout,
    HardwareError(String),
}

impl StepStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepStatus::Ok)
    }
}
