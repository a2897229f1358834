//! Normalizer for records coming out of the language pipeline

use crate::{Entity, Span, Utterance, UtteranceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

/// Wire record produced by the language pipeline, one per recognized segment.
///
/// Everything is optional at this level so that validation can report precisely what is
/// missing instead of failing inside the decoder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInput {
    /// Conversation the record belongs to; routing only, not part of the utterance
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, alias = "raw_text")]
    pub text: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEntity {
    #[serde(default, rename = "type", alias = "entity_type")]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub span: Option<Span>,
}

impl RawInput {
    pub fn new(intent: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent: Some(intent.into()),
            confidence: Some(confidence),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.entities.push(RawEntity {
            entity_type: Some(entity_type.into()),
            value: Some(value.into()),
            span: None,
        });
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedInputError {
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("intent is empty")]
    EmptyIntent,
    #[error("confidence is not a finite number")]
    NonFiniteConfidence,
    #[error("undecodable record: {0}")]
    Decode(String),
}

/// Validate a raw record and build an [`Utterance`].
///
/// Missing required fields (intent, confidence, entity type or value) fail the record.
/// Minor violations are repaired and logged: confidence outside `[0, 1]` is clamped and an
/// entity span that does not fit the text is dropped.
pub fn normalize(raw: RawInput) -> Result<Utterance, MalformedInputError> {
    let id = raw.id.map(UtteranceId).unwrap_or_default();

    let intent = raw
        .intent
        .ok_or_else(|| MalformedInputError::MissingField("intent".to_string()))?
        .trim()
        .to_lowercase();
    if intent.is_empty() {
        return Err(MalformedInputError::EmptyIntent);
    }

    let confidence = raw
        .confidence
        .ok_or_else(|| MalformedInputError::MissingField("confidence".to_string()))?;
    if !confidence.is_finite() {
        return Err(MalformedInputError::NonFiniteConfidence);
    }
    let confidence = if (0.0..=1.0).contains(&confidence) {
        confidence as f32
    } else {
        let clamped = confidence.clamp(0.0, 1.0);
        warn!(utterance_id = %id, confidence, clamped, "confidence out of range, clamping");
        clamped as f32
    };

    let raw_text = raw.text.unwrap_or_default();
    let mut entities = Vec::with_capacity(raw.entities.len());
    for (index, entity) in raw.entities.into_iter().enumerate() {
        let entity_type = entity
            .entity_type
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MalformedInputError::MissingField(format!("entities[{index}].type")))?;
        let value = entity
            .value
            .ok_or_else(|| MalformedInputError::MissingField(format!("entities[{index}].value")))?
            .trim()
            .to_string();

        let span = match entity.span {
            Some(span) if span.start <= span.end && raw_text.get(span.start..span.end).is_some() => {
                Some(span)
            }
            Some(span) => {
                warn!(utterance_id = %id, index, ?span, "entity span outside text, dropping span");
                None
            }
            None => None,
        };

        entities.push(Entity {
            entity_type,
            value,
            span,
        });
    }

    Ok(Utterance::from_parts(
        id,
        raw.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
        raw_text,
        intent,
        entities,
        confidence,
    ))
}

/// Decode one JSON record and normalize it. Returns the routing session id alongside.
pub fn normalize_json(line: &str) -> Result<(Option<String>, Utterance), MalformedInputError> {
    let raw: RawInput =
        serde_json::from_str(line).map_err(|e| MalformedInputError::Decode(e.to_string()))?;
    let session_id = raw.session_id.clone();
    normalize(raw).map(|u| (session_id, u))
}
