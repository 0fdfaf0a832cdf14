use serde::{Deserialize, Serialize};

use super::table::{PricingEntry, PricingTable};
use crate::error::{BeamError, BeamResult};
use crate::models::TokenUsage;

/// Cost reported for an exchange whose model has no pricing entry.
pub const UNPRICED_COST: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub prompt_cost: f64,
    pub completion_cost: f64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn unpriced() -> Self {
        Self {
            prompt_cost: UNPRICED_COST,
            completion_cost: UNPRICED_COST,
            total_cost: UNPRICED_COST,
        }
    }

    pub fn is_priced(&self) -> bool {
        self.total_cost >= 0.0
    }

    /// Six fractional digits, the display convention for costs.
    pub fn display_total(&self) -> String {
        format!("{:.6}", self.total_cost)
    }
}

/// Prices `usage` for `model`. No rounding happens here.
pub fn cost(model: &str, usage: &TokenUsage, pricing: &PricingTable) -> BeamResult<CostBreakdown> {
    let entry = pricing
        .get(model)
        .ok_or_else(|| BeamError::PricingMissing(model.to_string()))?;
    price(model, entry, usage)
}

fn price(model: &str, entry: &PricingEntry, usage: &TokenUsage) -> BeamResult<CostBreakdown> {
    if entry.per_tokens == 0 {
        return Err(BeamError::invalid_input(format!(
            "pricing for '{}' has per_tokens = 0",
            model
        )));
    }

    let per_tokens = entry.per_tokens as f64;
    let prompt_cost = entry.prompt_cost * usage.prompt_tokens as f64 / per_tokens;
    let completion_cost = entry.completion_cost * usage.completion_tokens as f64 / per_tokens;

    Ok(CostBreakdown {
        prompt_cost,
        completion_cost,
        total_cost: prompt_cost + completion_cost,
    })
}

/// A priced exchange together with the entry that priced it. `entry` is
/// `None` exactly when `breakdown` is the unpriced sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub breakdown: CostBreakdown,
    pub entry: Option<PricingEntry>,
}

/// Owns a pricing table and prices usage against it.
#[derive(Debug, Clone)]
pub struct CostCalculator {
    pricing: PricingTable,
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new(PricingTable::default_table())
    }
}

impl CostCalculator {
    pub fn new(pricing: PricingTable) -> Self {
        Self { pricing }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn calculate(&self, model: &str, usage: &TokenUsage) -> BeamResult<CostBreakdown> {
        cost(model, usage, &self.pricing)
    }

    /// Like [`calculate`](Self::calculate) but a pricing gap degrades to
    /// [`CostBreakdown::unpriced`] instead of an error.
    pub fn calculate_or_unpriced(&self, model: &str, usage: &TokenUsage) -> CostBreakdown {
        self.quote(model, usage, &PricingTable::new()).breakdown
    }

    /// Prices against `overrides` first and the calculator's own table
    /// second. An override entry that cannot price (`per_tokens = 0`) is
    /// skipped. A gap on both sides degrades to the unpriced sentinel.
    pub fn quote(&self, model: &str, usage: &TokenUsage, overrides: &PricingTable) -> Quote {
        let candidates = overrides.get(model).into_iter().chain(self.pricing.get(model));
        let mut last_err = None;
        for entry in candidates {
            match price(model, entry, usage) {
                Ok(breakdown) => {
                    return Quote {
                        breakdown,
                        entry: Some(*entry),
                    }
                }
                Err(err) => last_err = Some(err),
            }
        }

        let err = last_err.unwrap_or_else(|| BeamError::PricingMissing(model.to_string()));
        tracing::warn!(model = %model, error = %err, "cost unavailable for model");
        Quote {
            breakdown: CostBreakdown::unpriced(),
            entry: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricingEntry;

    fn usage(prompt: u64, completion: u64) -> TokenUsage {
        TokenUsage::new(prompt, completion)
    }

    #[test]
    fn test_cost_formula() {
        let table =
            PricingTable::new().with_entry("gpt-4", PricingEntry::per_thousand(0.03, 0.06));
        let breakdown = cost("gpt-4", &usage(1000, 500), &table).unwrap();

        assert!((breakdown.prompt_cost - 0.03).abs() < 1e-12);
        assert!((breakdown.completion_cost - 0.03).abs() < 1e-12);
        assert!((breakdown.total_cost - 0.06).abs() < 1e-12);
    }

    #[test]
    fn test_cost_respects_per_tokens() {
        let table = PricingTable::new().with_entry("m", PricingEntry::new(2.0, 4.0, 1_000_000));
        let breakdown = cost("m", &usage(500_000, 250_000), &table).unwrap();
        assert!((breakdown.total_cost - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_pricing_missing() {
        let table = PricingTable::default_table();
        let err = cost("unknown-model-x", &usage(100, 50), &table).unwrap_err();
        assert!(matches!(err, BeamError::PricingMissing(ref m) if m == "unknown-model-x"));
    }

    #[test]
    fn test_zero_per_tokens_is_rejected() {
        let table = PricingTable::new().with_entry("m", PricingEntry::new(1.0, 1.0, 0));
        assert!(matches!(
            cost("m", &usage(1, 1), &table),
            Err(BeamError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_calculate_or_unpriced() {
        let calc = CostCalculator::default();
        let breakdown = calc.calculate_or_unpriced("unknown-model-x", &usage(100, 50));
        assert!(!breakdown.is_priced());
        assert_eq!(breakdown.total_cost, UNPRICED_COST);

        let priced = calc.calculate_or_unpriced("gpt-3.5-turbo", &usage(100, 50));
        assert!(priced.is_priced());
    }

    #[test]
    fn test_quote_prefers_overrides_and_skips_unusable_entries() {
        let calc = CostCalculator::default();
        let custom = PricingTable::new().with_entry("gpt-4", PricingEntry::per_thousand(1.0, 1.0));
        let quote = calc.quote("gpt-4", &usage(1000, 1000), &custom);
        assert!((quote.breakdown.total_cost - 2.0).abs() < 1e-12);
        assert_eq!(quote.entry, Some(PricingEntry::per_thousand(1.0, 1.0)));

        let broken = PricingTable::new().with_entry("gpt-4", PricingEntry::new(1.0, 1.0, 0));
        let quote = calc.quote("gpt-4", &usage(1000, 0), &broken);
        assert!((quote.breakdown.total_cost - 0.03).abs() < 1e-12);
        assert_eq!(quote.entry.map(|e| e.per_tokens), Some(1000));

        let gap = calc.quote("unknown-model-x", &usage(1, 1), &PricingTable::new());
        assert!(!gap.breakdown.is_priced());
        assert!(gap.entry.is_none());
    }

    #[test]
    fn test_display_total() {
        let breakdown = CostBreakdown {
            prompt_cost: 0.0003,
            completion_cost: 0.0003,
            total_cost: 0.0006,
        };
        assert_eq!(breakdown.display_total(), "0.000600");
    }
}
