use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unit prices for one model, charged per `per_tokens` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub prompt_cost: f64,
    pub completion_cost: f64,
    #[serde(default = "default_per_tokens")]
    pub per_tokens: u64,
}

fn default_per_tokens() -> u64 {
    1000
}

impl PricingEntry {
    pub fn new(prompt_cost: f64, completion_cost: f64, per_tokens: u64) -> Self {
        Self {
            prompt_cost,
            completion_cost,
            per_tokens,
        }
    }

    pub fn per_thousand(prompt_cost: f64, completion_cost: f64) -> Self {
        Self::new(prompt_cost, completion_cost, 1000)
    }
}

/// Model id to pricing. Serialises as a plain JSON object so it can travel
/// inside a summary as `pricing_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    entries: BTreeMap<String, PricingEntry>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, model: impl Into<String>, entry: PricingEntry) -> Self {
        self.insert(model, entry);
        self
    }

    pub fn insert(&mut self, model: impl Into<String>, entry: PricingEntry) {
        self.entries.insert(model.into(), entry);
    }

    /// Exact match first, then the longest registered id that prefixes the
    /// model up to a `-` boundary, so dated snapshots such as `gpt-4-0613`
    /// resolve to `gpt-4`.
    pub fn get(&self, model: &str) -> Option<&PricingEntry> {
        if let Some(entry) = self.entries.get(model) {
            return Some(entry);
        }

        self.entries
            .iter()
            .filter(|(id, _)| {
                model.len() > id.len()
                    && model.starts_with(id.as_str())
                    && model.as_bytes()[id.len()] == b'-'
            })
            .max_by_key(|(id, _)| id.len())
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.get(model).is_some()
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PricingEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prices in USD per 1000 tokens.
    pub fn default_table() -> Self {
        Self::new()
            .with_entry("gpt-4", PricingEntry::per_thousand(0.03, 0.06))
            .with_entry("gpt-4-32k", PricingEntry::per_thousand(0.06, 0.12))
            .with_entry("gpt-4-turbo", PricingEntry::per_thousand(0.01, 0.03))
            .with_entry("gpt-4o", PricingEntry::per_thousand(0.005, 0.015))
            .with_entry("gpt-4o-mini", PricingEntry::per_thousand(0.00015, 0.0006))
            .with_entry("gpt-3.5-turbo", PricingEntry::per_thousand(0.0015, 0.002))
            .with_entry(
                "gpt-3.5-turbo-16k",
                PricingEntry::per_thousand(0.003, 0.004),
            )
            .with_entry(
                "claude-3-opus",
                PricingEntry::per_thousand(0.015, 0.075),
            )
            .with_entry(
                "claude-3-5-sonnet",
                PricingEntry::per_thousand(0.003, 0.015),
            )
            .with_entry(
                "claude-3-haiku",
                PricingEntry::per_thousand(0.00025, 0.00125),
            )
    }
}

impl FromIterator<(String, PricingEntry)> for PricingTable {
    fn from_iter<I: IntoIterator<Item = (String, PricingEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_has_common_models() {
        let table = PricingTable::default_table();
        assert!(table.contains("gpt-4"));
        assert!(table.contains("gpt-3.5-turbo"));
        assert!(!table.is_empty());
    }

    #[test]
    fn test_exact_lookup_wins() {
        let table = PricingTable::default_table();
        let entry = table.get("gpt-3.5-turbo-16k").unwrap();
        assert_eq!(entry.prompt_cost, 0.003);
    }

    #[test]
    fn test_dated_snapshot_resolves_to_base_model() {
        let table = PricingTable::default_table();
        assert_eq!(table.get("gpt-4-0613"), table.get("gpt-4"));
        assert_eq!(table.get("gpt-4-32k-0613"), table.get("gpt-4-32k"));
        assert_eq!(table.get("gpt-4o-2024-05-13"), table.get("gpt-4o"));
    }

    #[test]
    fn test_prefix_requires_dash_boundary() {
        let table = PricingTable::new().with_entry("gpt-4", PricingEntry::per_thousand(1.0, 1.0));
        assert!(table.get("gpt-4x").is_none());
        assert!(table.get("gpt-").is_none());
    }

    #[test]
    fn test_unknown_model() {
        let table = PricingTable::default_table();
        assert!(table.get("unknown-model-x").is_none());
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let table =
            PricingTable::new().with_entry("gpt-4", PricingEntry::per_thousand(0.03, 0.06));
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(json["gpt-4"]["prompt_cost"], 0.03);
        assert_eq!(json["gpt-4"]["per_tokens"], 1000);

        let back: PricingTable = serde_json::from_value(json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_per_tokens_defaults_when_absent() {
        let entry: PricingEntry =
            serde_json::from_str(r#"{"prompt_cost": 0.01, "completion_cost": 0.02}"#).unwrap();
        assert_eq!(entry.per_tokens, 1000);
    }
}
