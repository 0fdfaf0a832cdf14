use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{ExchangeStore, SummaryStore};
use crate::error::{BeamError, BeamResult};
use crate::models::{ChatExchange, SummaryFields, TokenUsageSummary};

/// Process-local store. Summaries are keyed by conversation id, so the
/// uniqueness of a conversation's summary is enforced by the map itself.
#[derive(Default)]
pub struct MemoryStore {
    summaries: DashMap<String, TokenUsageSummary>,
    exchanges: RwLock<Vec<ChatExchange>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary_count(&self) -> usize {
        self.summaries.len()
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.read().map(|e| e.len()).unwrap_or(0)
    }
}

fn poisoned() -> BeamError {
    BeamError::Internal("exchange log lock poisoned".to_string())
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> BeamResult<Option<TokenUsageSummary>> {
        Ok(self.summaries.get(conversation_id).map(|s| s.clone()))
    }

    async fn create(&self, summary: &TokenUsageSummary) -> BeamResult<TokenUsageSummary> {
        match self.summaries.entry(summary.conversation_id.clone()) {
            Entry::Occupied(_) => Err(BeamError::AlreadyExists(
                summary.conversation_id.clone(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(summary.clone());
                Ok(summary.clone())
            }
        }
    }

    async fn update(&self, id: Uuid, fields: &SummaryFields) -> BeamResult<TokenUsageSummary> {
        let mut entry = self
            .summaries
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| BeamError::NotFound(format!("summary {}", id)))?;
        entry.overwrite(fields.clone());
        Ok(entry.clone())
    }

    async fn delete_by_conversation_id(&self, conversation_id: &str) -> BeamResult<u64> {
        Ok(self.summaries.remove(conversation_id).map_or(0, |_| 1))
    }

    async fn list(&self) -> BeamResult<Vec<TokenUsageSummary>> {
        let mut all: Vec<TokenUsageSummary> =
            self.summaries.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }
}

#[async_trait]
impl ExchangeStore for MemoryStore {
    async fn append(&self, exchange: &ChatExchange) -> BeamResult<ChatExchange> {
        self.exchanges
            .write()
            .map_err(|_| poisoned())?
            .push(exchange.clone());
        Ok(exchange.clone())
    }

    async fn list(&self, conversation_id: Option<&str>) -> BeamResult<Vec<ChatExchange>> {
        let exchanges = self.exchanges.read().map_err(|_| poisoned())?;
        let mut found: Vec<ChatExchange> = exchanges
            .iter()
            .filter(|e| conversation_id.map_or(true, |id| e.conversation_id == id))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(found)
    }

    async fn delete_by_conversation_id(&self, conversation_id: &str) -> BeamResult<u64> {
        let mut exchanges = self.exchanges.write().map_err(|_| poisoned())?;
        let before = exchanges.len();
        exchanges.retain(|e| e.conversation_id != conversation_id);
        Ok((before - exchanges.len()) as u64)
    }
}
