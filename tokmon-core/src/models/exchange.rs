use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::summary::{SummaryFields, TokenUsage};
use crate::error::{BeamError, BeamResult};

/// The parts of a response payload the aggregator understands. Everything
/// else in the payload is carried through untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseUsage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// One recorded request/response pair. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatExchange {
    pub id: Uuid,
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
    pub request: Value,
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_id: Option<Uuid>,
}

impl ChatExchange {
    pub fn new(conversation_id: impl Into<String>, request: Value, response: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            timestamp: Utc::now(),
            request,
            response,
            summary_id: None,
        }
    }

    pub fn with_summary(mut self, summary_id: Uuid) -> Self {
        self.summary_id = Some(summary_id);
        self
    }

    /// Model and token usage reported by the response, if it carries both.
    pub fn response_usage(&self) -> Option<(String, TokenUsage)> {
        let parsed: ResponseUsage = serde_json::from_value(self.response.clone()).ok()?;
        Some((parsed.model?, parsed.usage?.normalized()))
    }
}

/// Inbound payload of the ingest boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSubmission {
    #[serde(default, alias = "tokmon_conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub summary_delta: Option<SummaryFields>,
}

impl ExchangeSubmission {
    pub fn new(conversation_id: impl Into<String>, request: Value, response: Value) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            request,
            response,
            summary_delta: None,
        }
    }

    pub fn with_summary_delta(mut self, delta: SummaryFields) -> Self {
        self.summary_delta = Some(delta);
        self
    }

    /// Trimmed conversation id, or `InvalidInput` when missing or blank.
    pub fn conversation_id(&self) -> BeamResult<&str> {
        validate_conversation_id(self.conversation_id.as_deref())
    }
}

pub(crate) fn validate_conversation_id(id: Option<&str>) -> BeamResult<&str> {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(BeamError::invalid_input("conversation_id is required")),
    }
}
