use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{ExchangeStore, SummaryStore};
use crate::error::{BeamError, BeamResult};
use crate::models::{ChatExchange, SummaryFields, TokenUsage, TokenUsageSummary};
use crate::pricing::PricingTable;

const SUMMARY_COLUMNS: &str =
    "id, conversation_id, monitored_program, total_cost, total_usage, pricing_data, models, updated_at";

const EXCHANGE_COLUMNS: &str = "id, conversation_id, timestamp, request, response, summary_id";

#[derive(FromRow)]
struct SummaryRow {
    id: Uuid,
    conversation_id: String,
    monitored_program: Option<String>,
    total_cost: f64,
    total_usage: Json<TokenUsage>,
    pricing_data: Json<PricingTable>,
    models: Vec<String>,
    updated_at: DateTime<Utc>,
}

impl From<SummaryRow> for TokenUsageSummary {
    fn from(row: SummaryRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            monitored_program: row.monitored_program,
            total_cost: row.total_cost,
            total_usage: row.total_usage.0,
            pricing_data: row.pricing_data.0,
            models: row.models.into_iter().collect(),
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ExchangeRow {
    id: Uuid,
    conversation_id: String,
    timestamp: DateTime<Utc>,
    request: Value,
    response: Value,
    summary_id: Option<Uuid>,
}

impl From<ExchangeRow> for ChatExchange {
    fn from(row: ExchangeRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            timestamp: row.timestamp,
            request: row.request,
            response: row.response,
            summary_id: row.summary_id,
        }
    }
}

/// PostgreSQL-backed store. The unique constraint on `conversation_id`
/// keeps one summary per conversation even across processes.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SummaryStore for PgStore {
    async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> BeamResult<Option<TokenUsageSummary>> {
        let row = sqlx::query_as::<_, SummaryRow>(&format!(
            "SELECT {} FROM token_usage_summaries WHERE conversation_id = $1",
            SUMMARY_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn create(&self, summary: &TokenUsageSummary) -> BeamResult<TokenUsageSummary> {
        let models: Vec<String> = summary.models.iter().cloned().collect();
        let row = sqlx::query_as::<_, SummaryRow>(&format!(
            r#"
            INSERT INTO token_usage_summaries ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (conversation_id) DO NOTHING
            RETURNING {cols}
            "#,
            cols = SUMMARY_COLUMNS
        ))
        .bind(summary.id)
        .bind(&summary.conversation_id)
        .bind(&summary.monitored_program)
        .bind(summary.total_cost)
        .bind(Json(&summary.total_usage))
        .bind(Json(&summary.pricing_data))
        .bind(models)
        .bind(summary.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| BeamError::AlreadyExists(summary.conversation_id.clone()))
    }

    async fn update(&self, id: Uuid, fields: &SummaryFields) -> BeamResult<TokenUsageSummary> {
        let models: Vec<String> = fields.models.iter().cloned().collect();
        let row = sqlx::query_as::<_, SummaryRow>(&format!(
            r#"
            UPDATE token_usage_summaries
            SET monitored_program = COALESCE($2, monitored_program),
                total_cost = $3,
                total_usage = $4,
                pricing_data = $5,
                models = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            SUMMARY_COLUMNS
        ))
        .bind(id)
        .bind(&fields.monitored_program)
        .bind(fields.total_cost)
        .bind(Json(&fields.total_usage))
        .bind(Json(&fields.pricing_data))
        .bind(models)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| BeamError::NotFound(format!("summary {}", id)))
    }

    async fn delete_by_conversation_id(&self, conversation_id: &str) -> BeamResult<u64> {
        let result = sqlx::query("DELETE FROM token_usage_summaries WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list(&self) -> BeamResult<Vec<TokenUsageSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(&format!(
            "SELECT {} FROM token_usage_summaries ORDER BY updated_at DESC",
            SUMMARY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ExchangeStore for PgStore {
    async fn append(&self, exchange: &ChatExchange) -> BeamResult<ChatExchange> {
        let row = sqlx::query_as::<_, ExchangeRow>(&format!(
            r#"
            INSERT INTO chat_exchanges ({cols})
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {cols}
            "#,
            cols = EXCHANGE_COLUMNS
        ))
        .bind(exchange.id)
        .bind(&exchange.conversation_id)
        .bind(exchange.timestamp)
        .bind(&exchange.request)
        .bind(&exchange.response)
        .bind(exchange.summary_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn list(&self, conversation_id: Option<&str>) -> BeamResult<Vec<ChatExchange>> {
        let rows = match conversation_id {
            Some(id) => {
                sqlx::query_as::<_, ExchangeRow>(&format!(
                    "SELECT {} FROM chat_exchanges WHERE conversation_id = $1 ORDER BY timestamp DESC",
                    EXCHANGE_COLUMNS
                ))
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ExchangeRow>(&format!(
                    "SELECT {} FROM chat_exchanges ORDER BY timestamp DESC",
                    EXCHANGE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_by_conversation_id(&self, conversation_id: &str) -> BeamResult<u64> {
        let result = sqlx::query("DELETE FROM chat_exchanges WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
