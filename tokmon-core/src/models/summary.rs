use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::exchange::{validate_conversation_id, ChatExchange};
use crate::error::BeamResult;
use crate::pricing::{PricingEntry, PricingTable};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Fills in `total_tokens` when the reporter left it out.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens.saturating_add(self.completion_tokens);
        }
        self
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// The caller-visible, overwritable part of a summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitored_program: Option<String>,
    pub total_cost: f64,
    pub total_usage: TokenUsage,
    #[serde(default)]
    pub pricing_data: PricingTable,
    #[serde(default)]
    pub models: BTreeSet<String>,
}

impl SummaryFields {
    pub fn new(total_cost: f64, total_usage: TokenUsage) -> Self {
        Self {
            total_cost,
            total_usage,
            ..Default::default()
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing_data = pricing;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.monitored_program = Some(program.into());
        self
    }
}

/// Running aggregate for one conversation. At most one exists per
/// `conversation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageSummary {
    pub id: Uuid,
    pub conversation_id: String,
    pub monitored_program: Option<String>,
    pub total_cost: f64,
    pub total_usage: TokenUsage,
    pub pricing_data: PricingTable,
    pub models: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

impl TokenUsageSummary {
    pub fn empty(conversation_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            monitored_program: None,
            total_cost: 0.0,
            total_usage: TokenUsage::default(),
            pricing_data: PricingTable::new(),
            models: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// A new summary whose totals are exactly `fields`.
    pub fn seeded(conversation_id: impl Into<String>, fields: SummaryFields) -> Self {
        let mut summary = Self::empty(conversation_id);
        summary.overwrite(fields);
        summary
    }

    /// Verbatim replacement of the running totals. `monitored_program` is
    /// only replaced when the caller supplies one.
    pub fn overwrite(&mut self, fields: SummaryFields) {
        if fields.monitored_program.is_some() {
            self.monitored_program = fields.monitored_program;
        }
        self.total_cost = fields.total_cost;
        self.total_usage = fields.total_usage;
        self.pricing_data = fields.pricing_data;
        self.models = fields.models;
        self.updated_at = Utc::now();
    }

    /// Folds one exchange's usage into the totals. `cost` is `None` when the
    /// model could not be priced; tokens and model are recorded regardless.
    pub fn accumulate(
        &mut self,
        model: &str,
        usage: &TokenUsage,
        cost: Option<f64>,
        pricing: Option<&PricingEntry>,
    ) {
        self.total_usage.add(usage);
        if let Some(cost) = cost {
            self.total_cost += cost;
        }
        if let Some(entry) = pricing {
            self.pricing_data.insert(model, *entry);
        }
        self.models.insert(model.to_string());
        self.updated_at = Utc::now();
    }

    pub fn fields(&self) -> SummaryFields {
        SummaryFields {
            monitored_program: self.monitored_program.clone(),
            total_cost: self.total_cost,
            total_usage: self.total_usage,
            pricing_data: self.pricing_data.clone(),
            models: self.models.clone(),
        }
    }
}

/// Body of the standalone summary upsert.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryUpsert {
    #[serde(default, alias = "tokmon_conversation_id")]
    pub conversation_id: Option<String>,
    #[serde(flatten)]
    pub fields: SummaryFields,
}

impl SummaryUpsert {
    pub fn conversation_id(&self) -> BeamResult<&str> {
        validate_conversation_id(self.conversation_id.as_deref())
    }
}

/// A summary together with the exchanges that share its conversation id.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub summary: TokenUsageSummary,
    pub chat_exchanges: Vec<ChatExchange>,
}
