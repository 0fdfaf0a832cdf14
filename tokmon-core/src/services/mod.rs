pub mod aggregation;
pub mod keyed_lock;

pub use aggregation::{AggregationService, DeleteOutcome, IngestOutcome, MergePolicy};
pub use keyed_lock::{KeyGuard, KeyedLocks};
