//! Job state tracking.
//!
//! The tracker owns every mutation of a [`Job`] after intake: dispatch
//! metadata, the one-way transition to Processed or Failed, and the
//! `finished_at` stamp (set exactly once). State lives in an in-memory map
//! for fast reads and is written through to SQLite on every change.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::cost::CostTotals;
use crate::job::{Job, JobStatus};
use crate::store::{job_repo, Database, StoreError};

pub use crate::store::job_repo::JobFilter;

pub struct JobTracker {
    jobs: RwLock<HashMap<String, Job>>,
    db: Database,
}

impl JobTracker {
    pub fn new(db: Database) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            db,
        }
    }

    /// Registers a new job. Returns `false` when a job with the same id
    /// already exists (in memory or on disk); nothing is written in that
    /// case.
    pub fn create(&self, job: Job) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().expect("job cache poisoned");
        if jobs.contains_key(&job.job_id) || job_repo::get(&self.db, &job.job_id)?.is_some() {
            return Ok(false);
        }
        job_repo::insert(&self.db, &job)?;
        jobs.insert(job.job_id.clone(), job);
        Ok(true)
    }

    /// Stores page/unit counts once the splitter has run.
    pub fn record_dispatch(
        &self,
        job_id: &str,
        page_count: u32,
        unit_count: u32,
    ) -> Result<(), StoreError> {
        self.mutate(job_id, |job| {
            job.page_count = page_count;
            job.unit_count = unit_count;
        })
    }

    /// Terminal transition to Processed. Ignored with a warning if the job
    /// is already terminal.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_processed(
        &self,
        job_id: &str,
        totals: CostTotals,
        record_count: u64,
        error_summary: Option<String>,
        output_file_references: Vec<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.finalize(job_id, finished_at, move |job| {
            job.status = JobStatus::Processed;
            job.ocr_cost = totals.ocr;
            job.llm_cost = totals.llm;
            job.total_cost = totals.total();
            job.record_count = record_count;
            job.error_summary = error_summary;
            job.output_file_references = output_file_references;
        })
    }

    /// Terminal transition to Failed. Failed jobs carry zero cost.
    pub fn finalize_failed(
        &self,
        job_id: &str,
        error_summary: String,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.finalize(job_id, finished_at, move |job| {
            job.status = JobStatus::Failed;
            job.error_summary = Some(error_summary);
        })
    }

    fn finalize(
        &self,
        job_id: &str,
        finished_at: DateTime<Utc>,
        apply: impl FnOnce(&mut Job),
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().expect("job cache poisoned");
        let Some(job) = Self::load_into(&self.db, &mut jobs, job_id)? else {
            log::warn!("Ignoring terminal transition for unknown job '{job_id}'");
            return Ok(());
        };
        if job.status.is_terminal() {
            log::warn!(
                "Ignoring repeated terminal transition for job '{}' (already {})",
                job_id,
                job.status
            );
            return Ok(());
        }
        apply(job);
        job.finished_at = Some(finished_at);
        job_repo::update(&self.db, job)
    }

    fn mutate(&self, job_id: &str, apply: impl FnOnce(&mut Job)) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().expect("job cache poisoned");
        let Some(job) = Self::load_into(&self.db, &mut jobs, job_id)? else {
            log::warn!("Ignoring update for unknown job '{job_id}'");
            return Ok(());
        };
        apply(job);
        job_repo::update(&self.db, job)
    }

    /// Cache lookup with read-through to the database.
    fn load_into<'a>(
        db: &Database,
        jobs: &'a mut HashMap<String, Job>,
        job_id: &str,
    ) -> Result<Option<&'a mut Job>, StoreError> {
        if !jobs.contains_key(job_id) {
            if let Some(job) = job_repo::get(db, job_id)? {
                jobs.insert(job_id.to_string(), job);
            } else {
                return Ok(None);
            }
        }
        Ok(jobs.get_mut(job_id))
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        if let Some(job) = self.jobs.read().expect("job cache poisoned").get(job_id) {
            return Ok(Some(job.clone()));
        }
        job_repo::get(&self.db, job_id)
    }

    /// Filtered listing straight from the database, newest first.
    pub fn query(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        job_repo::query(&self.db, filter)
    }

    /// Fails every job left InProgress by a previous process. Called once
    /// at engine start; returns the affected job ids.
    pub fn fail_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let stale = job_repo::query(
            &self.db,
            &JobFilter {
                status: Some(JobStatus::InProgress),
                ..Default::default()
            },
        )?;

        let mut failed = Vec::with_capacity(stale.len());
        for job in stale {
            self.finalize_failed(
                &job.job_id,
                "processing interrupted by service restart".to_string(),
                now,
            )?;
            failed.push(job.job_id);
        }
        if !failed.is_empty() {
            log::warn!("Failed {} job(s) interrupted by restart", failed.len());
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::IntakeRequest;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn tracker() -> JobTracker {
        JobTracker::new(Database::open_in_memory().unwrap())
    }

    fn job(job_id: &str) -> Job {
        let request = IntakeRequest {
            job_id: job_id.to_string(),
            tenant_id: "acme".to_string(),
            category_id: 1,
            source_file_reference: "uploads/a.pdf".to_string(),
            original_filename: "a.pdf".to_string(),
            model_hint: None,
        };
        Job::from_request(
            &request,
            "profile-1",
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        )
    }

    #[test]
    fn create_rejects_duplicates() {
        let tracker = tracker();
        assert!(tracker.create(job("job-1")).unwrap());
        assert!(!tracker.create(job("job-1")).unwrap());
    }

    #[test]
    fn finalize_processed_sets_costs_and_finished_at_once() {
        let tracker = tracker();
        tracker.create(job("job-1")).unwrap();
        tracker.record_dispatch("job-1", 45, 3).unwrap();

        let finished = Utc.with_ymd_and_hms(2024, 3, 1, 9, 2, 0).unwrap();
        let totals = CostTotals {
            ocr: "0.45".parse().unwrap(),
            llm: "0.03".parse().unwrap(),
        };
        tracker
            .finalize_processed(
                "job-1",
                totals,
                30,
                Some("pages 16-30: transient failure".to_string()),
                vec!["mem://a.csv".to_string()],
                finished,
            )
            .unwrap();

        // A second terminal transition must not move the job or its stamp.
        tracker
            .finalize_failed("job-1", "late failure".to_string(), finished + chrono::Duration::hours(1))
            .unwrap();

        let loaded = tracker.get("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processed);
        assert_eq!(loaded.finished_at, Some(finished));
        assert_eq!(loaded.total_cost, "0.48".parse::<Decimal>().unwrap());
        assert_eq!(loaded.record_count, 30);
        assert_eq!(loaded.page_count, 45);
        assert_eq!(loaded.unit_count, 3);
        assert_eq!(
            loaded.error_summary.as_deref(),
            Some("pages 16-30: transient failure")
        );
    }

    #[test]
    fn finalize_failed_records_summary_and_zero_cost() {
        let tracker = tracker();
        tracker.create(job("job-1")).unwrap();
        let finished = Utc.with_ymd_and_hms(2024, 3, 1, 9, 1, 0).unwrap();
        tracker
            .finalize_failed("job-1", "source document has zero pages".to_string(), finished)
            .unwrap();

        let loaded = tracker.get("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.total_cost, Decimal::ZERO);
        assert_eq!(
            loaded.error_summary.as_deref(),
            Some("source document has zero pages")
        );
    }

    #[test]
    fn state_survives_a_new_tracker_on_the_same_database() {
        let db = Database::open_in_memory().unwrap();
        let first = JobTracker::new(db.clone());
        first.create(job("job-1")).unwrap();

        let second = JobTracker::new(db);
        let loaded = second.get("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::InProgress);
        // Write-through works on the read-through copy too.
        second.record_dispatch("job-1", 10, 1).unwrap();
        assert_eq!(second.get("job-1").unwrap().unwrap().page_count, 10);
    }

    #[test]
    fn fail_interrupted_finalizes_stale_in_progress_jobs() {
        let db = Database::open_in_memory().unwrap();
        let first = JobTracker::new(db.clone());
        first.create(job("job-1")).unwrap();
        first.create(job("job-2")).unwrap();
        first
            .finalize_processed(
                "job-2",
                CostTotals::default(),
                0,
                None,
                Vec::new(),
                Utc.with_ymd_and_hms(2024, 3, 1, 9, 5, 0).unwrap(),
            )
            .unwrap();

        let second = JobTracker::new(db);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let failed = second.fail_interrupted(now).unwrap();
        assert_eq!(failed, vec!["job-1".to_string()]);

        let loaded = second.get("job-1").unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.finished_at, Some(now));
        assert_eq!(
            second.get("job-2").unwrap().unwrap().status,
            JobStatus::Processed
        );
    }
}
