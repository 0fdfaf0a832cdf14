pub mod calculator;
pub mod table;

pub use calculator::{cost, CostBreakdown, CostCalculator, Quote, UNPRICED_COST};
pub use table::{PricingEntry, PricingTable};
