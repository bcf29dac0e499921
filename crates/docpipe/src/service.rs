//! The embeddable processing engine.
//!
//! [`Engine::start`] wires the collaborators to the pipeline, recovers state
//! left behind by a previous process (jobs stuck InProgress, callbacks still
//! owed), and spins up the job runners. [`Engine::submit`] is the intake
//! boundary: it validates synchronously and either enqueues the job or
//! rejects the request with nothing persisted beyond the job row itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::collab::{ObjectStore, OcrEngine, ProfileStore, RecordExtractor};
use crate::config::{default_database_path, Settings};
use crate::deliver::{DeliveryClient, DeliveryPayload, DeliveryTransport, WebhookTransport};
use crate::error::{IntakeError, Result};
use crate::job::{IntakeRequest, Job};
use crate::pipeline::{Pipeline, PipelineParts};
use crate::profile::ProfileResolver;
use crate::progress::{ProgressBroadcaster, ProgressEvent};
use crate::store::{delivery_repo, Database};
use crate::tracker::{JobFilter, JobTracker};

/// External services the engine runs against. OCR, extraction, profiles,
/// and storage are mandatory; the webhook transport and the clock have
/// production defaults.
pub struct Collaborators {
    pub ocr: Arc<dyn OcrEngine>,
    pub extractor: Arc<dyn RecordExtractor>,
    pub profiles: Arc<dyn ProfileStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub transport: Option<Arc<dyn DeliveryTransport>>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        extractor: Arc<dyn RecordExtractor>,
        profiles: Arc<dyn ProfileStore>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            ocr,
            extractor,
            profiles,
            storage,
            transport: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the webhook transport built from configuration. With a
    /// custom transport the delivery endpoint setting is not consulted.
    pub fn with_transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct Engine {
    job_sender: Sender<Job>,
    runners: Vec<JoinHandle<()>>,
    resume_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    tracker: Arc<JobTracker>,
    resolver: ProfileResolver,
    broadcaster: ProgressBroadcaster,
    clock: Arc<dyn Clock>,
    /// Serializes intake so the capacity check and the enqueue are atomic
    /// with respect to other submitters.
    intake: Mutex<()>,
    queue_capacity: usize,
}

impl Engine {
    /// Validates the settings, opens the database, recovers interrupted
    /// work, and starts the job runners.
    pub fn start(settings: Settings, collaborators: Collaborators) -> Result<Self> {
        settings.validate()?;

        let Collaborators {
            ocr,
            extractor,
            profiles,
            storage,
            transport,
            clock,
        } = collaborators;

        let db_path = match &settings.database_path {
            Some(path) => path.clone(),
            None => default_database_path()?,
        };
        let db = Database::open(&db_path)?;
        let tracker = Arc::new(JobTracker::new(db.clone()));

        let interrupted = tracker.fail_interrupted(clock.now())?;
        if !interrupted.is_empty() {
            warn!(
                "Failed {} job(s) left in progress by a previous run",
                interrupted.len()
            );
        }

        let broadcaster = ProgressBroadcaster::default();
        let pipeline = Arc::new(Pipeline::new(
            PipelineParts {
                storage,
                ocr,
                extractor,
                profiles: Arc::clone(&profiles),
                clock: Arc::clone(&clock),
                tracker: Arc::clone(&tracker),
                delivery: delivery_client(transport.clone(), &settings, &clock, &db)?,
                broadcaster: broadcaster.clone(),
            },
            &settings,
        ));

        let resume_handle =
            Self::resume_pending_deliveries(&settings, transport, &clock, &db, &tracker)?;

        let queue_capacity = settings.workers.queue_capacity;
        let (job_sender, job_receiver) = bounded::<Job>(queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let runner_count = settings.workers.job_runners;
        let mut runners = Vec::with_capacity(runner_count);
        for runner_id in 0..runner_count {
            let job_rx = job_receiver.clone();
            let runner_pipeline = Arc::clone(&pipeline);
            let shutdown_flag = Arc::clone(&shutdown);
            runners.push(thread::spawn(move || {
                run_runner(runner_id, job_rx, runner_pipeline, shutdown_flag);
            }));
        }
        info!("Started {} job runner(s)", runner_count);

        Ok(Self {
            job_sender,
            runners,
            resume_handle,
            shutdown,
            tracker,
            resolver: ProfileResolver::new(profiles),
            broadcaster,
            clock,
            intake: Mutex::new(()),
            queue_capacity,
        })
    }

    /// Re-runs the delivery loop for every job whose latest recorded
    /// attempt is still Pending. Runs on its own thread so webhook backoff
    /// never stalls startup.
    fn resume_pending_deliveries(
        settings: &Settings,
        transport: Option<Arc<dyn DeliveryTransport>>,
        clock: &Arc<dyn Clock>,
        db: &Database,
        tracker: &Arc<JobTracker>,
    ) -> Result<Option<JoinHandle<()>>> {
        let pending = delivery_repo::jobs_with_pending_delivery(db)?;
        if pending.is_empty() {
            return Ok(None);
        }

        let Some(client) = delivery_client(transport, settings, clock, db)? else {
            warn!(
                "{} job(s) have undelivered results but no delivery transport is configured",
                pending.len()
            );
            return Ok(None);
        };

        info!("Resuming delivery for {} job(s)", pending.len());
        let tracker = Arc::clone(tracker);
        Ok(Some(thread::spawn(move || {
            for job_id in pending {
                match tracker.get(&job_id) {
                    Ok(Some(job)) if job.status.is_terminal() => {
                        match client.deliver(&DeliveryPayload::from_job(&job)) {
                            Ok(status) => {
                                info!("Resumed delivery for job '{job_id}': {status}")
                            }
                            Err(e) => {
                                error!("Could not record delivery attempts for job '{job_id}': {e}")
                            }
                        }
                    }
                    Ok(Some(job)) => warn!(
                        "Skipping delivery resume for job '{job_id}' in non-terminal status {}",
                        job.status
                    ),
                    Ok(None) => {
                        warn!("Pending delivery references unknown job '{job_id}'")
                    }
                    Err(e) => error!("Could not load job '{job_id}' for delivery resume: {e}"),
                }
            }
        })))
    }

    /// Accepts or rejects a processing request synchronously. On `Ok` the
    /// job is persisted as InProgress, queued, and announced on the
    /// progress stream; on `Err` nothing was enqueued.
    pub fn submit(&self, request: IntakeRequest) -> Result<()> {
        let _guard = self.intake.lock().expect("intake lock poisoned");

        if self.shutdown.load(Ordering::Relaxed) {
            return Err(IntakeError::ShuttingDown.into());
        }
        request.validate()?;
        if self.job_sender.is_full() {
            return Err(IntakeError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into());
        }

        let profile = self
            .resolver
            .resolve(&request.tenant_id, request.category_id)
            .map_err(|e| IntakeError::Configuration {
                tenant_id: request.tenant_id.clone(),
                category_id: request.category_id,
                reason: e.to_string(),
            })?;

        let job = Job::from_request(&request, &profile.profile_id, self.clock.now());
        if !self.tracker.create(job.clone())? {
            return Err(IntakeError::DuplicateJob(job.job_id).into());
        }

        let job_id = job.job_id.clone();
        let filename = job.original_filename.clone();
        if self.job_sender.try_send(job).is_err() {
            // Runners only detach during shutdown; the capacity check above
            // keeps a full queue out of this path.
            if let Err(e) = self.tracker.finalize_failed(
                &job_id,
                "engine stopped before dispatch".to_string(),
                self.clock.now(),
            ) {
                error!("Could not fail undispatched job '{job_id}': {e}");
            }
            return Err(IntakeError::ShuttingDown.into());
        }

        self.broadcaster.start_job(&job_id, &filename);
        debug!("Accepted job '{job_id}' ({filename})");
        Ok(())
    }

    /// Live progress events for all jobs. Subscribers receive events sent
    /// after the point of subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.broadcaster.subscribe()
    }

    pub fn status(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.tracker.get(job_id)?)
    }

    pub fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.tracker.query(filter)?)
    }

    /// Stops accepting jobs and tells the runners to exit after their
    /// current job.
    pub fn shutdown(&self) {
        info!("Shutting down engine...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Waits for the runners (and any delivery resume) to finish. Without a
    /// preceding [`shutdown`](Self::shutdown) the queue is drained first.
    pub fn wait(self) {
        drop(self.job_sender);

        if let Some(handle) = self.resume_handle {
            if handle.join().is_err() {
                error!("Delivery resume thread panicked");
            }
        }
        for (i, runner) in self.runners.into_iter().enumerate() {
            if runner.join().is_err() {
                error!("Runner {i} panicked");
            } else {
                debug!("Runner {i} finished");
            }
        }
        info!("All runners have stopped");
    }
}

/// Builds the delivery client: an injected transport wins, otherwise a
/// webhook transport when an endpoint is configured, otherwise none.
fn delivery_client(
    transport: Option<Arc<dyn DeliveryTransport>>,
    settings: &Settings,
    clock: &Arc<dyn Clock>,
    db: &Database,
) -> Result<Option<DeliveryClient>> {
    let transport: Option<Arc<dyn DeliveryTransport>> = match transport {
        Some(custom) => Some(custom),
        None if settings.delivery.endpoint.is_some() => {
            Some(Arc::new(WebhookTransport::from_config(&settings.delivery)?))
        }
        None => None,
    };
    Ok(transport.map(|transport| {
        DeliveryClient::new(transport, Arc::clone(clock), db.clone(), &settings.delivery)
    }))
}

fn run_runner(
    runner_id: usize,
    jobs: Receiver<Job>,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Runner {runner_id} started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Runner {runner_id} received shutdown signal");
            break;
        }

        match jobs.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => pipeline.process(job),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Runner {runner_id} job channel disconnected");
                break;
            }
        }
    }

    debug!("Runner {runner_id} stopped");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    // The crate-level alias from `super::*` would shadow the two-parameter
    // form the fake collaborators return.
    use std::result::Result;
    use std::sync::Mutex;

    use super::*;
    use crate::collab::{
        ExtractionRequest, MemoryObjectStore, OcrText, RawExtraction, RawRecord,
        StaticProfileStore,
    };
    use crate::deliver::DeliveryStatus;
    use crate::error::{DeliveryError, DocpipeError, ExtractError};
    use crate::job::JobStatus;
    use crate::profile::test_support::minimal_profile;
    use crate::progress::JobPhase;
    use crate::split::PageRange;
    use crate::store::delivery_repo::DeliveryAttemptRow;
    use chrono::Utc;

    struct FixedOcr {
        pages: u32,
    }

    impl OcrEngine for FixedOcr {
        fn page_count(&self, _document: &[u8], _timeout: Duration) -> Result<u32, ExtractError> {
            Ok(self.pages)
        }

        fn recognize(
            &self,
            _document: &[u8],
            pages: PageRange,
            _timeout: Duration,
        ) -> Result<OcrText, ExtractError> {
            Ok(OcrText {
                text: format!("text for {}", pages.label()),
                page_count: pages.page_count(),
            })
        }
    }

    struct OneRecordExtractor;

    impl RecordExtractor for OneRecordExtractor {
        fn extract(&self, _request: &ExtractionRequest<'_>) -> Result<RawExtraction, ExtractError> {
            Ok(one_record_extraction())
        }
    }

    /// Extractor that parks every call until the release sender is dropped.
    struct GatedExtractor {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl RecordExtractor for GatedExtractor {
        fn extract(&self, _request: &ExtractionRequest<'_>) -> Result<RawExtraction, ExtractError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(one_record_extraction())
        }
    }

    fn one_record_extraction() -> RawExtraction {
        RawExtraction {
            records: vec![RawRecord {
                page_no: 1,
                fields: vec![("name".to_string(), serde_json::json!("Widget"))],
                confidence_score: None,
            }],
            tokens_in: 2000,
            tokens_out: 1000,
            model_used: "gpt-4o-mini".to_string(),
            confidence_score: 0.9,
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        payloads: Mutex<Vec<DeliveryPayload>>,
    }

    impl DeliveryTransport for RecordingTransport {
        fn post(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn settings_with_db(path: PathBuf) -> Settings {
        let mut settings = Settings::default();
        settings.database_path = Some(path);
        settings.workers.job_runners = 1;
        settings
    }

    fn collaborators(extractor: Arc<dyn RecordExtractor>) -> (Collaborators, Arc<MemoryObjectStore>) {
        let storage = Arc::new(MemoryObjectStore::new());
        storage.put("uploads/invoice.pdf", "application/pdf", b"%PDF-1.7".to_vec());
        let profiles = StaticProfileStore::new().with_default(7, minimal_profile("cat7-default"));
        let collab = Collaborators::new(
            Arc::new(FixedOcr { pages: 45 }),
            extractor,
            Arc::new(profiles),
            Arc::clone(&storage) as Arc<dyn ObjectStore>,
        );
        (collab, storage)
    }

    fn request(job_id: &str) -> IntakeRequest {
        IntakeRequest {
            job_id: job_id.to_string(),
            tenant_id: "acme".to_string(),
            category_id: 7,
            source_file_reference: "uploads/invoice.pdf".to_string(),
            original_filename: "invoice.pdf".to_string(),
            model_hint: None,
        }
    }

    fn wait_until(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {what}");
    }

    fn intake_error(err: DocpipeError) -> IntakeError {
        match err {
            DocpipeError::Intake(inner) => inner,
            other => panic!("expected an intake error, got {other}"),
        }
    }

    #[test]
    fn submitted_job_runs_to_processed_with_progress_events() {
        let dir = tempfile::tempdir().unwrap();
        let (collab, storage) = collaborators(Arc::new(OneRecordExtractor));
        let engine = Engine::start(
            settings_with_db(dir.path().join("jobs.db")),
            collab,
        )
        .unwrap();

        let mut events = engine.subscribe();
        engine.submit(request("job-1")).unwrap();

        wait_until("job-1 to finish", || {
            engine
                .status("job-1")
                .unwrap()
                .is_some_and(|job| job.status.is_terminal())
        });

        let job = engine.status("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processed);
        assert_eq!(job.page_count, 45);
        assert_eq!(job.unit_count, 3);
        assert_eq!(job.record_count, 3);
        assert_eq!(job.output_file_references, vec!["mem://invoice_job-1.csv"]);
        assert!(storage.get("mem://invoice_job-1.csv").is_some());

        engine.shutdown();
        engine.wait();

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.job_id, "job-1");
            phases.push(event.phase);
        }
        assert_eq!(phases.first(), Some(&JobPhase::Queued));
        assert!(phases.contains(&JobPhase::Extracting));
        assert_eq!(phases.last(), Some(&JobPhase::Completed));
    }

    #[test]
    fn duplicate_job_ids_are_rejected_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let (collab, _storage) = collaborators(Arc::new(OneRecordExtractor));
        let engine =
            Engine::start(settings_with_db(dir.path().join("jobs.db")), collab).unwrap();

        engine.submit(request("job-1")).unwrap();
        let err = intake_error(engine.submit(request("job-1")).unwrap_err());
        assert!(matches!(err, IntakeError::DuplicateJob(id) if id == "job-1"));

        engine.shutdown();
        engine.wait();
    }

    #[test]
    fn unknown_category_is_rejected_and_nothing_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (collab, _storage) = collaborators(Arc::new(OneRecordExtractor));
        let engine =
            Engine::start(settings_with_db(dir.path().join("jobs.db")), collab).unwrap();

        let mut bad = request("job-1");
        bad.category_id = 42;
        let err = intake_error(engine.submit(bad).unwrap_err());
        assert!(matches!(
            err,
            IntakeError::Configuration { category_id: 42, .. }
        ));
        assert!(engine.status("job-1").unwrap().is_none());

        engine.shutdown();
        engine.wait();
    }

    #[test]
    fn blank_fields_are_rejected_before_anything_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (collab, _storage) = collaborators(Arc::new(OneRecordExtractor));
        let engine =
            Engine::start(settings_with_db(dir.path().join("jobs.db")), collab).unwrap();

        let mut bad = request("");
        bad.job_id = "  ".to_string();
        let err = intake_error(engine.submit(bad).unwrap_err());
        assert!(matches!(err, IntakeError::Validation { .. }));

        engine.shutdown();
        engine.wait();
    }

    #[test]
    fn full_queue_rejects_without_losing_accepted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = bounded::<()>(16);
        let (release_tx, release_rx) = bounded::<()>(0);
        let (collab, _storage) = collaborators(Arc::new(GatedExtractor {
            entered: entered_tx,
            release: release_rx,
        }));

        let mut settings = settings_with_db(dir.path().join("jobs.db"));
        settings.workers.queue_capacity = 1;
        settings.workers.max_parallel_workers = 1;
        let engine = Engine::start(settings, collab).unwrap();

        // job-1 occupies the runner (gated inside extract), job-2 fills the
        // queue, job-3 bounces.
        engine.submit(request("job-1")).unwrap();
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("runner should reach the extractor");
        engine.submit(request("job-2")).unwrap();
        let err = intake_error(engine.submit(request("job-3")).unwrap_err());
        assert!(matches!(err, IntakeError::QueueFull { capacity: 1 }));

        drop(release_tx);
        wait_until("both accepted jobs to finish", || {
            ["job-1", "job-2"].iter().all(|id| {
                engine
                    .status(id)
                    .unwrap()
                    .is_some_and(|job| job.status == JobStatus::Processed)
            })
        });
        assert!(engine.status("job-3").unwrap().is_none());

        engine.shutdown();
        engine.wait();
    }

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (collab, _storage) = collaborators(Arc::new(OneRecordExtractor));
        let engine =
            Engine::start(settings_with_db(dir.path().join("jobs.db")), collab).unwrap();

        engine.shutdown();
        assert!(engine.is_shutdown());
        let err = intake_error(engine.submit(request("job-1")).unwrap_err());
        assert!(matches!(err, IntakeError::ShuttingDown));

        engine.wait();
    }

    #[test]
    fn restart_fails_interrupted_jobs_and_resumes_owed_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");

        // Simulate a previous run: one job still InProgress, one Processed
        // with its callback not yet delivered.
        {
            let db = Database::open(&db_path).unwrap();
            let tracker = JobTracker::new(db.clone());
            let started = Utc::now();

            let stale = Job::from_request(&request("job-stale"), "cat7-default", started);
            tracker.create(stale).unwrap();

            let done = Job::from_request(&request("job-done"), "cat7-default", started);
            tracker.create(done).unwrap();
            tracker
                .finalize_processed(
                    "job-done",
                    crate::cost::CostTotals::default(),
                    5,
                    None,
                    vec!["mem://invoice_job-done.csv".to_string()],
                    started,
                )
                .unwrap();
            delivery_repo::record(
                &db,
                &DeliveryAttemptRow {
                    job_id: "job-done".to_string(),
                    attempt_number: 1,
                    scheduled_at: started,
                    status: DeliveryStatus::Pending,
                    last_error: Some("connection reset".to_string()),
                },
            )
            .unwrap();
        }

        let transport = Arc::new(RecordingTransport::default());
        let (collab, _storage) = collaborators(Arc::new(OneRecordExtractor));
        let collab = collab.with_transport(Arc::clone(&transport) as Arc<dyn DeliveryTransport>);
        let engine = Engine::start(settings_with_db(db_path), collab).unwrap();

        wait_until("the owed delivery to be posted", || {
            !transport.payloads.lock().unwrap().is_empty()
        });
        let payloads = transport.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].job_id, "job-done");
        assert_eq!(payloads[0].status, JobStatus::Processed);
        assert_eq!(payloads[0].total_records, 5);
        drop(payloads);

        let stale = engine.status("job-stale").unwrap().unwrap();
        assert_eq!(stale.status, JobStatus::Failed);
        assert!(stale
            .error_summary
            .as_deref()
            .unwrap()
            .contains("interrupted"));

        engine.shutdown();
        engine.wait();
    }
}
