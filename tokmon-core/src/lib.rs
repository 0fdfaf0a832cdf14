//! Core of tokmon-beam: per-conversation usage aggregation and the
//! real-time relay that fans ingested events out to observers.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod models;
pub mod pricing;
pub mod relay;
pub mod repo;
pub mod services;

pub use config::{AggregationConfig, BeamConfig, DatabaseConfig, LoggingConfig, RelayConfig};
pub use db::{init_database, Database};
pub use error::{BeamError, BeamResult};
pub use http::{router, serve, AppState, GatewayState};
pub use models::{
    ChatExchange, ConversationView, ExchangeSubmission, RelayEvent, SummaryFields, SummaryUpsert,
    TokenUsage, TokenUsageSummary,
};
pub use pricing::{cost, CostBreakdown, CostCalculator, PricingEntry, PricingTable, UNPRICED_COST};
pub use relay::{
    BroadcastReport, ConnectionHandle, ConnectionId, ConnectionState, DropReason, Frame,
    HubConfig, HubEvent, RelayHub,
};
pub use repo::{ExchangeStore, MemoryStore, PgStore, SummaryStore};
pub use services::{AggregationService, DeleteOutcome, IngestOutcome, MergePolicy};
