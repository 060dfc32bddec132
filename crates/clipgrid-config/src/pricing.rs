// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Cost per thousand tokens, input and output.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PriceRate {
    #[serde(default)]
    pub input_cost_per_thousand_tokens: f64,
    #[serde(default)]
    pub output_cost_per_thousand_tokens: f64,
}

/// One pricing tier.  `threshold_tokens = -1` means "no upper bound".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTier {
    #[serde(default)]
    pub threshold_tokens: i64,
    #[serde(flatten)]
    pub rate: PriceRate,
}

/// Per-model pricing entry: either tiered by input size or a flat rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<PriceRate>,
    #[serde(flatten)]
    pub flat: Option<PriceRate>,
}

/// Price table keyed by model id, used only for the cost note shown after a
/// completed single action.  An empty table yields zero rates everywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceTable(HashMap<String, ModelPricing>);

impl PriceTable {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            warn!(path = %path.display(), "price table not found, costs will read as unavailable");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let table: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(table)
    }

    /// Resolve the rate for `model_id` at `input_tokens`.
    ///
    /// Exact model-id match is tried first, then the first entry whose key is
    /// a substring of `model_id` (version-suffixed ids share a base entry).
    /// Unknown models return a zero rate so callers can flag the estimate as
    /// unavailable instead of guessing.
    pub fn rate_for(&self, model_id: &str, input_tokens: u32) -> PriceRate {
        if let Some(entry) = self.0.get(model_id) {
            return Self::resolve(entry, input_tokens);
        }
        for (key, entry) in &self.0 {
            if model_id.contains(key.as_str()) {
                return Self::resolve(entry, input_tokens);
            }
        }
        PriceRate::default()
    }

    /// Estimated cost of one call, or `None` when the model has no pricing.
    pub fn estimate(&self, model_id: &str, input_tokens: u32, output_tokens: u32) -> Option<f64> {
        let rate = self.rate_for(model_id, input_tokens);
        if rate.input_cost_per_thousand_tokens == 0.0 && rate.output_cost_per_thousand_tokens == 0.0 {
            return None;
        }
        Some(
            f64::from(input_tokens) / 1000.0 * rate.input_cost_per_thousand_tokens
                + f64::from(output_tokens) / 1000.0 * rate.output_cost_per_thousand_tokens,
        )
    }

    fn resolve(entry: &ModelPricing, input_tokens: u32) -> PriceRate {
        if !entry.tiers.is_empty() {
            // Largest threshold first; -1 sorts as the catch-all.
            let mut tiers: Vec<&PriceTier> = entry.tiers.iter().collect();
            tiers.sort_by_key(|t| std::cmp::Reverse(t.threshold_tokens));
            for tier in tiers {
                if tier.threshold_tokens == -1 || i64::from(input_tokens) <= tier.threshold_tokens {
                    return tier.rate;
                }
            }
            return entry.default.unwrap_or_default();
        }
        if let Some(flat) = entry.flat {
            return flat;
        }
        entry.default.unwrap_or_default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn table(json: &str) -> PriceTable {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn unknown_model_yields_zero_rate() {
        let t = PriceTable::default();
        let r = t.rate_for("gemini-2.5-pro", 100);
        assert_eq!(r.input_cost_per_thousand_tokens, 0.0);
        assert!(t.estimate("gemini-2.5-pro", 100, 100).is_none());
    }

    #[test]
    fn flat_rate_entry() {
        let t = table(
            r#"{"gemini-2.5-flash": {
                "input_cost_per_thousand_tokens": 0.3,
                "output_cost_per_thousand_tokens": 2.5
            }}"#,
        );
        let r = t.rate_for("gemini-2.5-flash", 10);
        assert_eq!(r.input_cost_per_thousand_tokens, 0.3);
        let cost = t.estimate("gemini-2.5-flash", 2000, 1000).unwrap();
        assert!((cost - (0.6 + 2.5)).abs() < 1e-9);
    }

    #[test]
    fn tiered_rate_selects_by_input_size() {
        let t = table(
            r#"{"gemini-2.5-pro": {
                "tiers": [
                    {"threshold_tokens": 200000,
                     "input_cost_per_thousand_tokens": 1.25,
                     "output_cost_per_thousand_tokens": 10.0},
                    {"threshold_tokens": -1,
                     "input_cost_per_thousand_tokens": 2.5,
                     "output_cost_per_thousand_tokens": 15.0}
                ]
            }}"#,
        );
        assert_eq!(t.rate_for("gemini-2.5-pro", 1000).input_cost_per_thousand_tokens, 1.25);
        assert_eq!(t.rate_for("gemini-2.5-pro", 500_000).input_cost_per_thousand_tokens, 2.5);
    }

    #[test]
    fn substring_match_falls_back_to_base_entry() {
        let t = table(
            r#"{"gemini-2.5-flash": {
                "input_cost_per_thousand_tokens": 0.3,
                "output_cost_per_thousand_tokens": 2.5
            }}"#,
        );
        let r = t.rate_for("models/gemini-2.5-flash-001", 10);
        assert_eq!(r.output_cost_per_thousand_tokens, 2.5);
    }
}
