//! Persistence contracts the core depends on.
//!
//! The aggregation service only ever talks to these traits; the storage
//! engine behind them is interchangeable. [`MemoryStore`] backs a single
//! process, [`PgStore`] backs a PostgreSQL deployment.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BeamResult;
use crate::models::{ChatExchange, SummaryFields, TokenUsageSummary};

#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> BeamResult<Option<TokenUsageSummary>>;

    /// Inserts a new summary. Fails with `AlreadyExists` when the
    /// conversation already has one; never writes a second row.
    async fn create(&self, summary: &TokenUsageSummary) -> BeamResult<TokenUsageSummary>;

    /// Overwrites the running totals of summary `id` with `fields`.
    async fn update(&self, id: Uuid, fields: &SummaryFields) -> BeamResult<TokenUsageSummary>;

    async fn delete_by_conversation_id(&self, conversation_id: &str) -> BeamResult<u64>;

    /// All summaries, most recently updated first.
    async fn list(&self) -> BeamResult<Vec<TokenUsageSummary>>;
}

#[async_trait]
pub trait ExchangeStore: Send + Sync {
    /// Appends unconditionally; duplicates are kept.
    async fn append(&self, exchange: &ChatExchange) -> BeamResult<ChatExchange>;

    /// Exchanges newest first, optionally restricted to one conversation.
    async fn list(&self, conversation_id: Option<&str>) -> BeamResult<Vec<ChatExchange>>;

    async fn delete_by_conversation_id(&self, conversation_id: &str) -> BeamResult<u64>;
}
