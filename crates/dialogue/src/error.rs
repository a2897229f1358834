use std::path::PathBuf;
use thiserror::Error;

/// The rule table cannot be used; detected when it is built, never while serving.
#[derive(Debug, Error)]
pub enum RuleTableError {
    #[error("duplicate rule name `{0}`")]
    DuplicateName(String),
    #[error("rule `{rule}` has an empty intent")]
    EmptyIntent { rule: String },
    #[error("rule `{rule}` has no steps")]
    NoSteps { rule: String },
    #[error("rule `{rule}` references undeclared slot `{slot}`")]
    UndeclaredSlot { rule: String, slot: String },
    #[error("rules `{first}` and `{second}` both match intent `{intent}` with {specificity} required slot(s)")]
    Ambiguous {
        intent: String,
        first: String,
        second: String,
        specificity: usize,
    },
    #[error("persona `{0}` is declared more than once")]
    DuplicatePersona(String),
    #[error("placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("reading rule table {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing rule table: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(#[from] RuleTableError),
}
