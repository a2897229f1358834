use crate::Entity;
use serde::Serialize;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct UtteranceId(pub Uuid);

impl UtteranceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UtteranceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One normalized unit of recognized language input.
///
/// Fields are private: once built an utterance never changes.
#[derive(Debug, Clone, Serialize)]
pub struct Utterance {
    id: UtteranceId,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    raw_text: String,
    intent: String,
    entities: Vec<Entity>,
    confidence: f32,
}

impl Utterance {
    pub(crate) fn from_parts(
        id: UtteranceId,
        timestamp: OffsetDateTime,
        raw_text: String,
        intent: String,
        entities: Vec<Entity>,
        confidence: f32,
    ) -> Self {
        Self {
            id,
            timestamp,
            raw_text,
            intent,
            entities,
            confidence,
        }
    }

    pub fn id(&self) -> UtteranceId {
        self.id
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn is_intent(&self, intent: &str) -> bool {
        self.intent == intent
    }

    /// First entity of the given slot type, in extraction order.
    pub fn entity(&self, entity_type: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }
}
