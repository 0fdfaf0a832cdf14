pub mod event;
pub mod exchange;
pub mod summary;

pub use event::RelayEvent;
pub use exchange::{ChatExchange, ExchangeSubmission, ResponseUsage};
pub use summary::{
    ConversationView, SummaryFields, SummaryUpsert, TokenUsage, TokenUsageSummary,
};
