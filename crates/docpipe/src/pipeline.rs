//! The per-job processing pipeline.
//!
//! Runs one accepted job end to end: download the source, split it into
//! units, drain the units through the extraction pool, consolidate, render
//! every requested format, upload the outputs, finalize the job, and deliver
//! the callback. Any stage failure before consolidation fails the job with
//! an explanatory summary; the callback is delivered either way and never
//! feeds back into job status.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, info_span};

use crate::clock::Clock;
use crate::collab::{ObjectStore, OcrEngine, ProfileStore, RecordExtractor};
use crate::config::Settings;
use crate::consolidate::consolidate;
use crate::cost::CostLedger;
use crate::deliver::{DeliveryClient, DeliveryPayload};
use crate::job::Job;
use crate::pool::{ExtractionPool, PoolJob};
use crate::profile::ProfileResolver;
use crate::progress::{JobPhase, JobProgress, ProgressBroadcaster};
use crate::render::{render_all, RenderContext};
use crate::split::split_units;
use crate::tracker::JobTracker;

/// Everything the pipeline needs, wired once at engine start.
pub struct PipelineParts {
    pub storage: Arc<dyn ObjectStore>,
    pub ocr: Arc<dyn OcrEngine>,
    pub extractor: Arc<dyn RecordExtractor>,
    pub profiles: Arc<dyn ProfileStore>,
    pub clock: Arc<dyn Clock>,
    pub tracker: Arc<JobTracker>,
    pub delivery: Option<DeliveryClient>,
    pub broadcaster: ProgressBroadcaster,
}

pub struct Pipeline {
    storage: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrEngine>,
    resolver: ProfileResolver,
    pool: ExtractionPool,
    tracker: Arc<JobTracker>,
    clock: Arc<dyn Clock>,
    delivery: Option<DeliveryClient>,
    broadcaster: ProgressBroadcaster,
    pages_per_unit: u32,
    call_timeout: Duration,
    job_timeout: chrono::Duration,
}

impl Pipeline {
    pub fn new(parts: PipelineParts, settings: &Settings) -> Self {
        let pool = ExtractionPool::new(
            Arc::clone(&parts.ocr),
            parts.extractor,
            Arc::clone(&parts.clock),
            settings.extraction.clone(),
            settings.pricing.clone(),
            settings.workers.max_parallel_workers,
        );

        Self {
            storage: parts.storage,
            ocr: parts.ocr,
            resolver: ProfileResolver::new(parts.profiles),
            pool,
            tracker: parts.tracker,
            clock: parts.clock,
            delivery: parts.delivery,
            broadcaster: parts.broadcaster,
            pages_per_unit: settings.split.pages_per_unit,
            call_timeout: settings.call_timeout(),
            job_timeout: chrono::Duration::seconds(settings.job.timeout_secs as i64),
        }
    }

    /// Runs one accepted job to a terminal state. Infallible from the
    /// caller's perspective: every outcome lands in the tracker and on the
    /// progress stream.
    pub fn process(&self, job: Job) {
        let _pipeline_span = info_span!("pipeline",
            job_id = %job.job_id,
            tenant_id = %job.tenant_id,
            filename = %job.original_filename,
        )
        .entered();

        let progress = self
            .broadcaster
            .attach(&job.job_id, &job.original_filename);

        match self.run_stages(&job, &progress) {
            Ok(record_count) => {
                self.deliver_outcome(&job.job_id, &progress);
                progress.completed(&format!("Extracted {record_count} record(s)"));
            }
            Err(summary) => {
                self.fail_job(&job, &summary);
                self.deliver_outcome(&job.job_id, &progress);
                progress.failed(&summary);
            }
        }
    }

    /// The happy path. Returns the consolidated record count, or the error
    /// summary the job is failed with.
    fn run_stages(&self, job: &Job, progress: &JobProgress) -> Result<u64, String> {
        let document = {
            let _step = info_span!("download_source").entered();
            progress.phase(JobPhase::Downloading, "Downloading source document");
            self.storage
                .download(&job.source_file_reference)
                .map_err(|e| format!("source download failed: {e}"))?
        };

        let profile = self
            .resolver
            .resolve(&job.tenant_id, job.category_id)
            .map_err(|e| format!("output profile resolution failed: {e}"))?;

        let units = {
            let _step = info_span!("split").entered();
            progress.phase(JobPhase::Splitting, "Splitting into work units");
            let page_count = self
                .ocr
                .page_count(&document, self.call_timeout)
                .map_err(|e| e.to_string())?;
            let units =
                split_units(page_count, self.pages_per_unit).map_err(|e| e.to_string())?;
            self.tracker
                .record_dispatch(&job.job_id, page_count, units.len() as u32)
                .map_err(|e| format!("could not persist dispatch metadata: {e}"))?;
            info!(
                pages = page_count,
                units = units.len(),
                "dispatching units"
            );
            units
        };
        let unit_count = units.len() as u32;

        let ledger = CostLedger::new();
        let outcomes = {
            let _step = info_span!("extract").entered();
            progress.extracting(unit_count);
            let pool_job = PoolJob {
                job_id: &job.job_id,
                document: &document,
                extraction_prompt: &profile.extraction_prompt,
                model_hint: job.model_hint.as_deref(),
                profile: &profile,
                deadline: job.started_at + self.job_timeout,
            };
            self.pool.run(&pool_job, units, &ledger)
        };

        let consolidation = {
            let _step = info_span!("consolidate").entered();
            progress.consolidating(outcomes.len() as u32, unit_count);
            consolidate(outcomes)
        };

        if !consolidation.any_succeeded() {
            return Err(consolidation
                .error_summary
                .unwrap_or_else(|| "every unit failed without detail".to_string()));
        }

        let _step = info_span!("render_and_store").entered();
        progress.phase(JobPhase::Rendering, "Rendering outputs");
        let processed_at = self.clock.now();
        let ctx = RenderContext {
            job,
            profile: &profile,
            consolidation: &consolidation,
            processed_at,
        };
        let outputs = render_all(&ctx).map_err(|e| format!("output rendering failed: {e}"))?;

        let mut references = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let reference = self
                .storage
                .upload(&output.filename, &output.content_type, &output.bytes)
                .map_err(|e| format!("output upload failed for '{}': {e}", output.filename))?;
            references.push(reference);
        }

        let record_count = consolidation.record_count();
        self.tracker
            .finalize_processed(
                &job.job_id,
                ledger.totals(),
                record_count,
                consolidation.error_summary.clone(),
                references,
                processed_at,
            )
            .map_err(|e| format!("could not persist final state: {e}"))?;

        info!(
            records = record_count,
            failed_units = consolidation.failed_units,
            total_cost = %ledger.total(),
            "job processed"
        );
        Ok(record_count)
    }

    fn fail_job(&self, job: &Job, summary: &str) {
        error!(job_id = %job.job_id, "job failed: {summary}");
        if let Err(e) =
            self.tracker
                .finalize_failed(&job.job_id, summary.to_string(), self.clock.now())
        {
            error!(job_id = %job.job_id, "could not persist failure: {e}");
        }
    }

    /// Posts the callback for the finalized job. Failures here are logged
    /// only; the job keeps whatever status finalization gave it.
    fn deliver_outcome(&self, job_id: &str, progress: &JobProgress) {
        let Some(delivery) = &self.delivery else {
            debug!(job_id, "no delivery endpoint configured; skipping callback");
            return;
        };

        let job = match self.tracker.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id, "job vanished before delivery");
                return;
            }
            Err(e) => {
                error!(job_id, "could not load job for delivery: {e}");
                return;
            }
        };

        let _step = info_span!("deliver").entered();
        progress.phase(JobPhase::Delivering, "Delivering results");
        match delivery.deliver(&DeliveryPayload::from_job(&job)) {
            Ok(status) => debug!(job_id, %status, "delivery finished"),
            Err(e) => error!(job_id, "could not persist delivery attempts: {e}"),
        }
    }
}
