//! Merges terminal unit outcomes into one ordered result set.
//!
//! Ordering is a function of unit index and intra-unit record order only;
//! the completion order of the workers never shows through. Page numbers
//! are rewritten from unit-local to absolute here, in one place.

use rust_decimal::Decimal;

use crate::record::Record;
use crate::split::{Unit, UnitStatus};

/// Job-level result of consolidation, ready for rendering.
#[derive(Debug, Clone, Default)]
pub struct Consolidation {
    pub records: Vec<Record>,
    /// One entry per failed unit, in unit order, e.g.
    /// `pages 16-30: Transient failure: rate limited`.
    pub error_summary: Option<String>,
    pub succeeded_units: u32,
    pub failed_units: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Unit costs summed; failed units carry zero and so contribute
    /// nothing.
    pub ocr_cost: Decimal,
    pub llm_cost: Decimal,
    /// Model reported by the first succeeded unit.
    pub model_used: Option<String>,
    /// Mean record confidence across the whole job.
    pub confidence_score: Option<f64>,
}

impl Consolidation {
    pub fn record_count(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn any_succeeded(&self) -> bool {
        self.succeeded_units > 0
    }

    pub fn total_cost(&self) -> Decimal {
        self.ocr_cost + self.llm_cost
    }
}

/// Consolidates unit outcomes in any order into the deterministic,
/// unit-ordered result set.
pub fn consolidate(mut units: Vec<Unit>) -> Consolidation {
    units.sort_by_key(|unit| unit.unit_index);

    let mut out = Consolidation::default();
    let mut failures: Vec<String> = Vec::new();

    for unit in units {
        match unit.status {
            UnitStatus::Succeeded => {
                out.succeeded_units += 1;
                out.tokens_in += unit.tokens_in;
                out.tokens_out += unit.tokens_out;
                out.ocr_cost += unit.ocr_cost;
                out.llm_cost += unit.llm_cost;
                if out.model_used.is_none() {
                    out.model_used = unit.model_used.clone();
                }
                let offset = unit.page_range.offset();
                for mut record in unit.extracted_records {
                    record.original_page_no += offset;
                    out.records.push(record);
                }
            }
            UnitStatus::Failed => {
                out.failed_units += 1;
                let reason = unit
                    .last_error
                    .as_deref()
                    .unwrap_or("unknown error")
                    .to_string();
                failures.push(format!("{}: {}", unit.page_range.label(), reason));
            }
            UnitStatus::Pending | UnitStatus::Running => {
                // The pool hands back terminal units only; anything else is
                // a lost unit and is reported as a failure.
                log::error!(
                    "Unit {} ({}) reached consolidation in non-terminal state '{}'",
                    unit.unit_index,
                    unit.page_range.label(),
                    unit.status.as_str()
                );
                out.failed_units += 1;
                failures.push(format!(
                    "{}: unit never reached a terminal state",
                    unit.page_range.label()
                ));
            }
        }
    }

    if !failures.is_empty() {
        out.error_summary = Some(failures.join("; "));
    }
    if !out.records.is_empty() {
        let sum: f64 = out.records.iter().map(|r| r.confidence_score).sum();
        out.confidence_score = Some(sum / out.records.len() as f64);
    }
    out
}
