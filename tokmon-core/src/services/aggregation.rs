use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::keyed_lock::KeyedLocks;
use crate::error::{BeamError, BeamResult};
use crate::models::{
    ChatExchange, ConversationView, ExchangeSubmission, SummaryFields, SummaryUpsert, TokenUsage,
    TokenUsageSummary,
};
use crate::pricing::{CostBreakdown, CostCalculator};
use crate::repo::{ExchangeStore, SummaryStore};

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// How an exchange's totals land on its conversation summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The caller supplied the authoritative running total.
    Overwrite,
    /// The core folds the response's own usage into the totals.
    Accumulate,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub exchange: ChatExchange,
    pub summary: TokenUsageSummary,
    pub policy: MergePolicy,
    /// Cost of this exchange alone; only known under `Accumulate`. An
    /// unpriced model reports the negative sentinel.
    pub exchange_cost: Option<CostBreakdown>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub exchanges: u64,
    pub summaries: u64,
}

enum Merge<'a> {
    Overwrite(&'a SummaryFields),
    Accumulate { model: &'a str, usage: TokenUsage },
    Touch,
}

/// How to reverse a summary write if the exchange behind it is lost.
enum Undo {
    Nothing,
    Restore(TokenUsageSummary),
    Remove,
}

struct Upserted {
    summary: TokenUsageSummary,
    undo: Undo,
    exchange_cost: Option<CostBreakdown>,
}

/// Owns the summary and exchange stores. Writers for the same conversation
/// are serialized; writers for different conversations run in parallel.
pub struct AggregationService {
    summaries: Arc<dyn SummaryStore>,
    exchanges: Arc<dyn ExchangeStore>,
    calculator: CostCalculator,
    locks: KeyedLocks,
    store_timeout: Duration,
}

impl AggregationService {
    pub fn new(summaries: Arc<dyn SummaryStore>, exchanges: Arc<dyn ExchangeStore>) -> Self {
        Self {
            summaries,
            exchanges,
            calculator: CostCalculator::default(),
            locks: KeyedLocks::new(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Both contracts served by one store, the usual case.
    pub fn with_store<S>(store: Arc<S>) -> Self
    where
        S: SummaryStore + ExchangeStore + 'static,
    {
        Self::new(store.clone(), store)
    }

    pub fn with_calculator(mut self, calculator: CostCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn calculator(&self) -> &CostCalculator {
        &self.calculator
    }

    /// Records one exchange and brings its conversation summary up to date.
    ///
    /// A present `summary_delta` is written verbatim; otherwise the
    /// response's `model` and `usage` are folded into the running totals.
    /// The exchange itself is always appended, duplicates included. When
    /// the append fails the summary write is undone, so a retried
    /// submission is counted once.
    pub async fn ingest(&self, submission: ExchangeSubmission) -> BeamResult<IngestOutcome> {
        self.ingest_then(submission, |_| {}).await
    }

    /// [`ingest`](Self::ingest), with `on_commit` run before the
    /// conversation's lock is released. Callers that publish the outcome
    /// from there publish in commit order.
    pub async fn ingest_then<F>(
        &self,
        submission: ExchangeSubmission,
        on_commit: F,
    ) -> BeamResult<IngestOutcome>
    where
        F: FnOnce(&IngestOutcome),
    {
        let conversation_id = submission.conversation_id()?.to_string();
        let exchange = ChatExchange::new(
            conversation_id.clone(),
            submission.request,
            submission.response,
        );

        let response_usage = exchange.response_usage();
        let (merge, policy) = match (&submission.summary_delta, &response_usage) {
            (Some(fields), _) => (Merge::Overwrite(fields), MergePolicy::Overwrite),
            (None, Some((model, usage))) => (
                Merge::Accumulate {
                    model: model.as_str(),
                    usage: *usage,
                },
                MergePolicy::Accumulate,
            ),
            (None, None) => (Merge::Touch, MergePolicy::Accumulate),
        };

        let _guard = self.locks.lock(&conversation_id).await;

        let upserted = self.upsert_locked(&conversation_id, &merge).await?;

        let exchange = exchange.with_summary(upserted.summary.id);
        let exchange = match self
            .bounded("append_exchange", self.exchanges.append(&exchange))
            .await
        {
            Ok(exchange) => exchange,
            Err(err) => {
                self.undo(&conversation_id, upserted.undo).await;
                return Err(err);
            }
        };

        let summary = upserted.summary;
        info!(
            conversation_id = %conversation_id,
            policy = ?policy,
            total_cost = summary.total_cost,
            total_tokens = summary.total_usage.total_tokens,
            "Exchange ingested"
        );

        let outcome = IngestOutcome {
            exchange,
            summary,
            policy,
            exchange_cost: upserted.exchange_cost,
        };
        on_commit(&outcome);
        Ok(outcome)
    }

    /// Verbatim upsert of a caller-tracked summary, no exchange recorded.
    pub async fn upsert_summary(&self, upsert: SummaryUpsert) -> BeamResult<TokenUsageSummary> {
        self.upsert_summary_then(upsert, |_| {}).await
    }

    /// [`upsert_summary`](Self::upsert_summary), with `on_commit` run under
    /// the conversation's lock.
    pub async fn upsert_summary_then<F>(
        &self,
        upsert: SummaryUpsert,
        on_commit: F,
    ) -> BeamResult<TokenUsageSummary>
    where
        F: FnOnce(&TokenUsageSummary),
    {
        let conversation_id = upsert.conversation_id()?.to_string();
        let _guard = self.locks.lock(&conversation_id).await;
        let upserted = self
            .upsert_locked(&conversation_id, &Merge::Overwrite(&upsert.fields))
            .await?;
        on_commit(&upserted.summary);
        Ok(upserted.summary)
    }

    /// Find-or-create followed by the write, run under the conversation's
    /// lock. A create that loses to another process re-reads once and
    /// takes the update path instead.
    async fn upsert_locked(&self, conversation_id: &str, merge: &Merge<'_>) -> BeamResult<Upserted> {
        let mut retried = false;
        loop {
            let existing = self
                .bounded(
                    "find_summary",
                    self.summaries.find_by_conversation_id(conversation_id),
                )
                .await?;

            let mut target = existing
                .clone()
                .unwrap_or_else(|| TokenUsageSummary::empty(conversation_id));
            let exchange_cost = self.apply(&mut target, merge);

            let written = match (existing, merge) {
                (Some(current), Merge::Touch) => Ok((current, Undo::Nothing)),
                (Some(current), _) => self
                    .bounded(
                        "update_summary",
                        self.summaries.update(current.id, &target.fields()),
                    )
                    .await
                    .map(|summary| (summary, Undo::Restore(current))),
                (None, _) => self
                    .bounded("create_summary", self.summaries.create(&target))
                    .await
                    .map(|summary| (summary, Undo::Remove)),
            };

            match written {
                Err(BeamError::AlreadyExists(_)) if !retried => {
                    debug!(conversation_id = %conversation_id, "Summary created concurrently, retrying as update");
                    retried = true;
                }
                other => {
                    return other.map(|(summary, undo)| Upserted {
                        summary,
                        undo,
                        exchange_cost,
                    })
                }
            }
        }
    }

    /// Puts the summary back the way `upsert_locked` found it. Runs under
    /// the same lock; a failure here is logged and the original error wins.
    async fn undo(&self, conversation_id: &str, undo: Undo) {
        let undone = match undo {
            Undo::Nothing => return,
            Undo::Restore(previous) => self
                .bounded(
                    "restore_summary",
                    self.summaries.update(previous.id, &previous.fields()),
                )
                .await
                .map(|_| ()),
            Undo::Remove => self
                .bounded(
                    "delete_summary",
                    self.summaries.delete_by_conversation_id(conversation_id),
                )
                .await
                .map(|_| ()),
        };

        match undone {
            Ok(()) => warn!(
                conversation_id = %conversation_id,
                "Exchange not stored, summary write rolled back"
            ),
            Err(err) => error!(
                conversation_id = %conversation_id,
                error = %err,
                "Summary rollback failed, totals include an unstored exchange"
            ),
        }
    }

    fn apply(&self, target: &mut TokenUsageSummary, merge: &Merge<'_>) -> Option<CostBreakdown> {
        match merge {
            Merge::Overwrite(fields) => {
                target.overwrite((*fields).clone());
                None
            }
            Merge::Accumulate { model, usage } => {
                let quote = self.calculator.quote(model, usage, &target.pricing_data);
                let priced = quote.entry.map(|_| quote.breakdown.total_cost);
                if priced.is_none() {
                    debug!(
                        conversation_id = %target.conversation_id,
                        model = %model,
                        "Totals keep tokens only"
                    );
                }
                target.accumulate(model, usage, priced, quote.entry.as_ref());
                Some(quote.breakdown)
            }
            Merge::Touch => None,
        }
    }

    pub async fn summary(&self, conversation_id: &str) -> BeamResult<Option<TokenUsageSummary>> {
        self.bounded(
            "find_summary",
            self.summaries.find_by_conversation_id(conversation_id),
        )
        .await
    }

    pub async fn summaries(&self) -> BeamResult<Vec<TokenUsageSummary>> {
        self.bounded("list_summaries", self.summaries.list()).await
    }

    pub async fn exchanges(&self, conversation_id: Option<&str>) -> BeamResult<Vec<ChatExchange>> {
        self.bounded("list_exchanges", self.exchanges.list(conversation_id))
            .await
    }

    pub async fn conversation(&self, conversation_id: &str) -> BeamResult<Option<ConversationView>> {
        let Some(summary) = self.summary(conversation_id).await? else {
            return Ok(None);
        };
        let chat_exchanges = self.exchanges(Some(conversation_id)).await?;
        Ok(Some(ConversationView {
            summary,
            chat_exchanges,
        }))
    }

    /// Every summary with its exchanges, most recently updated first.
    pub async fn conversations(&self) -> BeamResult<Vec<ConversationView>> {
        let summaries = self.summaries().await?;
        let mut by_conversation: HashMap<String, Vec<ChatExchange>> = HashMap::new();
        for exchange in self.exchanges(None).await? {
            by_conversation
                .entry(exchange.conversation_id.clone())
                .or_default()
                .push(exchange);
        }

        Ok(summaries
            .into_iter()
            .map(|summary| {
                let chat_exchanges = by_conversation
                    .remove(&summary.conversation_id)
                    .unwrap_or_default();
                ConversationView {
                    summary,
                    chat_exchanges,
                }
            })
            .collect())
    }

    /// Removes the conversation's exchanges and its summary together.
    pub async fn delete_conversation(&self, conversation_id: &str) -> BeamResult<DeleteOutcome> {
        if conversation_id.trim().is_empty() {
            return Err(BeamError::invalid_input("conversation_id is required"));
        }

        let _guard = self.locks.lock(conversation_id).await;

        let exchanges = self
            .bounded(
                "delete_exchanges",
                self.exchanges.delete_by_conversation_id(conversation_id),
            )
            .await?;
        let summaries = self
            .bounded(
                "delete_summary",
                self.summaries.delete_by_conversation_id(conversation_id),
            )
            .await?;

        info!(
            conversation_id = %conversation_id,
            exchanges,
            summaries,
            "Conversation deleted"
        );

        Ok(DeleteOutcome {
            exchanges,
            summaries,
        })
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> BeamResult<T>
    where
        F: Future<Output = BeamResult<T>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BeamError::StoreTimeout {
                operation,
                timeout: self.store_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryStore;
    use serde_json::json;

    fn service() -> (AggregationService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (AggregationService::with_store(store.clone()), store)
    }

    fn response(model: &str, prompt: u64, completion: u64) -> serde_json::Value {
        json!({
            "model": model,
            "usage": {
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": prompt + completion
            },
            "messages": [{"role": "assistant", "content": "ok"}]
        })
    }

    #[tokio::test]
    async fn test_missing_conversation_id_rejected_before_mutation() {
        let (service, store) = service();
        let submission: ExchangeSubmission =
            serde_json::from_value(json!({"request": {}, "response": {}})).unwrap();

        let err = service.ingest(submission).await.unwrap_err();
        assert!(matches!(err, BeamError::InvalidInput(_)));
        assert_eq!(store.summary_count(), 0);
        assert_eq!(store.exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_accumulate_from_response_usage() {
        let (service, _) = service();

        for _ in 0..2 {
            service
                .ingest(ExchangeSubmission::new(
                    "conv-acc",
                    json!({"model": "gpt-4"}),
                    response("gpt-4", 1000, 500),
                ))
                .await
                .unwrap();
        }

        let summary = service.summary("conv-acc").await.unwrap().unwrap();
        assert_eq!(summary.total_usage, TokenUsage::new(2000, 1000));
        assert!((summary.total_cost - 0.12).abs() < 1e-9);
        assert!(summary.models.contains("gpt-4"));
        assert!(summary.pricing_data.contains("gpt-4"));
    }

    #[tokio::test]
    async fn test_accumulate_prefers_conversation_pricing() {
        let (service, _) = service();
        let custom = crate::pricing::PricingTable::new()
            .with_entry("gpt-4", crate::pricing::PricingEntry::per_thousand(1.0, 1.0));
        service
            .upsert_summary(SummaryUpsert {
                conversation_id: Some("conv-p".to_string()),
                fields: SummaryFields::new(0.0, TokenUsage::default()).with_pricing(custom),
            })
            .await
            .unwrap();

        let outcome = service
            .ingest(ExchangeSubmission::new(
                "conv-p",
                json!({}),
                response("gpt-4", 1000, 1000),
            ))
            .await
            .unwrap();

        assert!((outcome.exchange_cost.unwrap().total_cost - 2.0).abs() < 1e-9);
        assert!((outcome.summary.total_cost - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_pricing_gap_is_not_fatal() {
        let (service, store) = service();
        let outcome = service
            .ingest(ExchangeSubmission::new(
                "conv-gap",
                json!({}),
                response("unknown-model-x", 100, 50),
            ))
            .await
            .unwrap();

        let cost = outcome.exchange_cost.unwrap();
        assert!(!cost.is_priced());
        assert_eq!(outcome.summary.total_cost, 0.0);
        assert_eq!(outcome.summary.total_usage.total_tokens, 150);
        assert!(outcome.summary.models.contains("unknown-model-x"));
        assert_eq!(store.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_exchange_without_usage_still_recorded() {
        let (service, store) = service();
        let outcome = service
            .ingest(ExchangeSubmission::new("conv-raw", json!("opaque"), json!(42)))
            .await
            .unwrap();

        assert_eq!(outcome.summary.total_usage, TokenUsage::default());
        assert_eq!(outcome.exchange.summary_id, Some(outcome.summary.id));
        assert_eq!(store.summary_count(), 1);

        service
            .ingest(ExchangeSubmission::new("conv-raw", json!("opaque"), json!(42)))
            .await
            .unwrap();
        assert_eq!(store.summary_count(), 1);
        assert_eq!(store.exchange_count(), 2);
    }

    #[tokio::test]
    async fn test_conversation_view() {
        let (service, _) = service();
        service
            .ingest(ExchangeSubmission::new("conv-v", json!({}), response("gpt-4", 1, 1)))
            .await
            .unwrap();

        let view = service.conversation("conv-v").await.unwrap().unwrap();
        assert_eq!(view.summary.conversation_id, "conv-v");
        assert_eq!(view.chat_exchanges.len(), 1);
        assert!(service.conversation("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conversations_group_exchanges() {
        let (service, _) = service();
        for conv in ["conv-a", "conv-b", "conv-a"] {
            service
                .ingest(ExchangeSubmission::new(conv, json!({}), json!({})))
                .await
                .unwrap();
        }

        let views = service.conversations().await.unwrap();
        assert_eq!(views.len(), 2);
        let a = views
            .iter()
            .find(|v| v.summary.conversation_id == "conv-a")
            .unwrap();
        assert_eq!(a.chat_exchanges.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_rejects_blank_id() {
        let (service, _) = service();
        assert!(matches!(
            service.delete_conversation("  ").await,
            Err(BeamError::InvalidInput(_))
        ));
    }
}
