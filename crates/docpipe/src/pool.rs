//! Bounded worker pool for per-unit extraction.
//!
//! One pool run covers one job: every unit is queued up front, a fixed
//! number of worker threads drain the queue, and each unit leaves the pool
//! in a terminal state (Succeeded or Failed) with its cost credited to the
//! job ledger exactly once. Outcomes are returned in completion order;
//! consolidation restores unit order.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use log::{debug, error, warn};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::clock::{backoff_delay, Clock};
use crate::collab::{ExtractionRequest, OcrEngine, RecordExtractor};
use crate::config::ExtractionConfig;
use crate::cost::{CostLedger, PricingTable};
use crate::error::ExtractError;
use crate::record::Record;
use crate::split::{Unit, UnitStatus};

pub struct ExtractionPool {
    ocr: Arc<dyn OcrEngine>,
    extractor: Arc<dyn RecordExtractor>,
    clock: Arc<dyn Clock>,
    retry: ExtractionConfig,
    pricing: PricingTable,
    max_workers: usize,
}

/// Everything the workers need that is fixed for the duration of one job.
pub struct PoolJob<'a> {
    pub job_id: &'a str,
    pub document: &'a [u8],
    pub extraction_prompt: &'a str,
    pub model_hint: Option<&'a str>,
    pub profile: &'a crate::profile::OutputProfile,
    /// Instant after which no further unit work may start.
    pub deadline: DateTime<Utc>,
}

impl ExtractionPool {
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        extractor: Arc<dyn RecordExtractor>,
        clock: Arc<dyn Clock>,
        retry: ExtractionConfig,
        pricing: PricingTable,
        max_workers: usize,
    ) -> Self {
        Self {
            ocr,
            extractor,
            clock,
            retry,
            pricing,
            max_workers,
        }
    }

    /// Runs every unit to a terminal state and returns the units in
    /// completion order. Blocks until all workers have finished.
    pub fn run(&self, job: &PoolJob<'_>, units: Vec<Unit>, ledger: &CostLedger) -> Vec<Unit> {
        let unit_count = units.len();
        if unit_count == 0 {
            return Vec::new();
        }

        let worker_count = self.max_workers.clamp(1, unit_count);
        let (unit_tx, unit_rx) = bounded::<Unit>(unit_count);
        let (outcome_tx, outcome_rx) = bounded::<Unit>(unit_count);

        for unit in units {
            unit_tx
                .send(unit)
                .expect("unit channel sized to hold every unit");
        }
        drop(unit_tx);

        debug!(
            "Job '{}': running {} unit(s) on {} worker(s)",
            job.job_id, unit_count, worker_count
        );

        thread::scope(|scope| {
            for worker_id in 0..worker_count {
                let unit_rx = unit_rx.clone();
                let outcome_tx = outcome_tx.clone();
                scope.spawn(move || {
                    debug!("Worker {} started for job '{}'", worker_id, job.job_id);
                    while let Ok(unit) = unit_rx.recv() {
                        let outcome = self.process_unit(job, unit, ledger);
                        if outcome_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                    debug!("Worker {} finished for job '{}'", worker_id, job.job_id);
                });
            }
            drop(outcome_tx);

            outcome_rx.iter().collect()
        })
    }

    /// Drives one unit through its attempts. The unit always comes back
    /// terminal, and the ledger is credited exactly once.
    fn process_unit(&self, job: &PoolJob<'_>, mut unit: Unit, ledger: &CostLedger) -> Unit {
        unit.status = UnitStatus::Running;
        let max_attempts = self.retry.max_attempts.max(1);
        let base = Duration::from_secs(self.retry.backoff_base_secs);
        let cap = Duration::from_secs(self.retry.backoff_cap_secs);

        let mut attempt = 0;
        loop {
            attempt += 1;
            unit.attempt_count = attempt;

            if self.clock.now() >= job.deadline {
                return self.fail_unit(job.job_id, unit, ledger, &ExtractError::JobDeadline);
            }

            match self.extract_once(job, &unit) {
                Ok((records, tokens_in, tokens_out, model_used)) => {
                    unit.ocr_cost = self.pricing.ocr_cost(unit.page_count());
                    unit.llm_cost = self.pricing.llm_cost(&model_used, tokens_in, tokens_out);
                    unit.tokens_in = tokens_in;
                    unit.tokens_out = tokens_out;
                    unit.model_used = Some(model_used);
                    unit.extracted_records = records;
                    unit.status = UnitStatus::Succeeded;
                    unit.last_error = None;
                    ledger.credit_unit(unit.ocr_cost, unit.llm_cost);
                    debug!(
                        "Job '{}': unit {} ({}) succeeded with {} record(s) on attempt {}",
                        job.job_id,
                        unit.unit_index,
                        unit.page_range.label(),
                        unit.record_count(),
                        attempt
                    );
                    return unit;
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(base, cap, attempt);
                    warn!(
                        "Job '{}': unit {} ({}) attempt {}/{} failed: {}; retrying in {}s",
                        job.job_id,
                        unit.unit_index,
                        unit.page_range.label(),
                        attempt,
                        max_attempts,
                        err,
                        delay.as_secs()
                    );
                    unit.last_error = Some(err.to_string());
                    self.clock.sleep(delay);
                }
                Err(err) => {
                    return self.fail_unit(job.job_id, unit, ledger, &err);
                }
            }
        }
    }

    fn fail_unit(
        &self,
        job_id: &str,
        mut unit: Unit,
        ledger: &CostLedger,
        err: &ExtractError,
    ) -> Unit {
        error!(
            "Job '{}': unit {} ({}) failed after {} attempt(s): {}",
            job_id,
            unit.unit_index,
            unit.page_range.label(),
            unit.attempt_count,
            err
        );
        unit.status = UnitStatus::Failed;
        unit.last_error = Some(err.to_string());
        unit.extracted_records.clear();
        // Failed units carry no cost, but the credit still lands so the
        // ledger can attest every unit was accounted for.
        ledger.credit_unit(Decimal::ZERO, Decimal::ZERO);
        unit
    }

    /// One OCR-then-extract round for a unit. Record page numbers stay
    /// unit-local here.
    fn extract_once(
        &self,
        job: &PoolJob<'_>,
        unit: &Unit,
    ) -> Result<(Vec<Record>, u64, u64, String), ExtractError> {
        let timeout = self.retry.call_timeout();
        let ocr = self.ocr.recognize(job.document, unit.page_range, timeout)?;
        let request = ExtractionRequest {
            text: &ocr.text,
            prompt: job.extraction_prompt,
            model_hint: job.model_hint,
            timeout,
        };
        let raw = self.extractor.extract(&request)?;
        let records = raw
            .records
            .iter()
            .map(|record| Record::from_raw(record, job.profile, raw.confidence_score))
            .collect();
        Ok((records, raw.tokens_in, raw.tokens_out, raw.model_used))
    }
}
