//! Entities extracted by the language pipeline

use serde::{Deserialize, Serialize};

/// Byte range of an entity within the raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A typed value extracted from an utterance (e.g. `room = kitchen`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Slot type, lower-case (`room`, `posture`, ...)
    pub entity_type: String,
    pub value: String,
    pub span: Option<Span>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            value: value.into(),
            span: None,
        }
    }

    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = Some(Span { start, end });
        self
    }

    /// The text the span points at, when the span is valid for `text`.
    pub fn surface<'a>(&self, text: &'a str) -> Option<&'a str> {
        let span = self.span?;
        text.get(span.start..span.end)
    }
}
