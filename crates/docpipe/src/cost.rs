//! Cost accounting.
//!
//! Every succeeded unit credits the job's ledger exactly once with its OCR
//! and LLM cost; failed units credit nothing. Accumulation uses `Decimal`
//! throughout so totals are exact sums of the captured per-unit values —
//! rounding happens once, at capture, never during accumulation.

use std::collections::HashMap;
use std::sync::Mutex;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Per-1k-token rates for one LLM model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_1k: Decimal,
    pub output_per_1k: Decimal,
}

/// External-service price list. Deserialized as part of
/// [`Settings`](crate::config::Settings); unknown models are priced at the
/// default model's rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default = "default_ocr_per_page")]
    pub ocr_per_page: Decimal,
    #[serde(default = "default_model_rates")]
    pub models: HashMap<String, ModelRates>,
    #[serde(default = "default_model")]
    pub default_model: String,
}

fn default_ocr_per_page() -> Decimal {
    // 0.015 per processed page.
    Decimal::new(15, 3)
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_model_rates() -> HashMap<String, ModelRates> {
    HashMap::from([
        (
            "gpt-4o".to_string(),
            ModelRates {
                input_per_1k: Decimal::new(25, 4),
                output_per_1k: Decimal::new(1, 2),
            },
        ),
        (
            "gpt-4o-mini".to_string(),
            ModelRates {
                input_per_1k: Decimal::new(15, 5),
                output_per_1k: Decimal::new(6, 4),
            },
        ),
    ])
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            ocr_per_page: default_ocr_per_page(),
            models: default_model_rates(),
            default_model: default_model(),
        }
    }
}

impl PricingTable {
    /// Rates for `model`, falling back to the default model, then to zero
    /// rates when even the default is unpriced.
    pub fn rates_for(&self, model: &str) -> ModelRates {
        if let Some(rates) = self.models.get(model) {
            return rates.clone();
        }
        if let Some(rates) = self.models.get(&self.default_model) {
            log::warn!(
                "No price entry for model '{}'; using default model '{}' rates",
                model,
                self.default_model
            );
            return rates.clone();
        }
        log::warn!("No price entry for model '{model}' and no default rates; costing zero");
        ModelRates {
            input_per_1k: Decimal::ZERO,
            output_per_1k: Decimal::ZERO,
        }
    }

    /// OCR cost for one unit, rounded to 4 decimal places.
    pub fn ocr_cost(&self, pages: u32) -> Decimal {
        (Decimal::from(pages) * self.ocr_per_page).round_dp(4)
    }

    /// LLM cost for one unit's reported token usage, rounded to 4 decimal
    /// places.
    pub fn llm_cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> Decimal {
        let rates = self.rates_for(model);
        let thousand = Decimal::from(1000);
        let cost = Decimal::from(tokens_in) / thousand * rates.input_per_1k
            + Decimal::from(tokens_out) / thousand * rates.output_per_1k;
        cost.round_dp(4)
    }
}

/// Job-level cost totals.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostTotals {
    pub ocr: Decimal,
    pub llm: Decimal,
}

impl CostTotals {
    pub fn total(&self) -> Decimal {
        self.ocr + self.llm
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    totals: CostTotals,
    credited_units: usize,
}

/// Thread-safe per-job cost accumulator. The only object in the pipeline
/// that multiple workers mutate concurrently.
#[derive(Debug, Default)]
pub struct CostLedger {
    inner: Mutex<LedgerInner>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credits one unit's terminal cost. Called exactly once per unit by
    /// the worker pool.
    pub fn credit_unit(&self, ocr_cost: Decimal, llm_cost: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        inner.totals.ocr += ocr_cost;
        inner.totals.llm += llm_cost;
        inner.credited_units += 1;
    }

    pub fn totals(&self) -> CostTotals {
        self.inner.lock().unwrap().totals
    }

    pub fn total(&self) -> Decimal {
        self.totals().total()
    }

    /// Number of units that have reached a terminal state and credited the
    /// ledger (including zero-cost failed units).
    pub fn credited_units(&self) -> usize {
        self.inner.lock().unwrap().credited_units
    }
}
