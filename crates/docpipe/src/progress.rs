//! Job progress broadcasting for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Phase of job processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Downloading,
    Splitting,
    Extracting,
    Consolidating,
    Rendering,
    Delivering,
    Completed,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "Queued"),
            JobPhase::Downloading => write!(f, "Downloading source"),
            JobPhase::Splitting => write!(f, "Splitting into work units"),
            JobPhase::Extracting => write!(f, "Extracting records"),
            JobPhase::Consolidating => write!(f, "Consolidating results"),
            JobPhase::Rendering => write!(f, "Rendering outputs"),
            JobPhase::Delivering => write!(f, "Delivering results"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Unique job identifier.
    pub job_id: String,
    /// Original filename being processed.
    pub filename: String,
    /// Current phase of processing.
    pub phase: JobPhase,
    /// Human-readable message describing current activity.
    pub message: String,
    /// Timestamp of this event.
    pub timestamp: DateTime<Utc>,
    /// Total work units for this job (set once splitting is done).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units_total: Option<u32>,
    /// Work units that reached a terminal state so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units_completed: Option<u32>,
    /// Error message (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    /// Creates a new progress event.
    pub fn new(job_id: &str, filename: &str, phase: JobPhase, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            filename: filename.to_string(),
            phase,
            message: message.to_string(),
            timestamp: Utc::now(),
            units_total: None,
            units_completed: None,
            error: None,
        }
    }

    /// Creates a completion event.
    pub fn completed(job_id: &str, filename: &str, message: &str) -> Self {
        Self::new(job_id, filename, JobPhase::Completed, message)
    }

    /// Creates a failure event.
    pub fn failed(job_id: &str, filename: &str, error: &str) -> Self {
        let mut event = Self::new(job_id, filename, JobPhase::Failed, "Processing failed");
        event.error = Some(error.to_string());
        event
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl ProgressBroadcaster {
    /// Creates a new progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: ProgressEvent) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a per-job progress handle and emits the initial queued event.
    pub fn start_job(&self, job_id: &str, filename: &str) -> JobProgress {
        let progress = self.attach(job_id, filename);
        progress.phase(JobPhase::Queued, "Job queued for processing");
        progress
    }

    /// Per-job handle without an initial event, for stages that pick up a
    /// job announced earlier.
    pub fn attach(&self, job_id: &str, filename: &str) -> JobProgress {
        JobProgress {
            job_id: job_id.to_string(),
            filename: filename.to_string(),
            sender: Arc::clone(&self.sender),
        }
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Tracks progress for a single job.
pub struct JobProgress {
    job_id: String,
    filename: String,
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl JobProgress {
    /// Updates the current phase with a message.
    pub fn phase(&self, phase: JobPhase, message: &str) {
        let event = ProgressEvent::new(&self.job_id, &self.filename, phase, message);
        let _ = self.sender.send(event);
    }

    /// Announces how many work units are about to run.
    pub fn extracting(&self, units_total: u32) {
        let mut event = ProgressEvent::new(
            &self.job_id,
            &self.filename,
            JobPhase::Extracting,
            &format!("Extracting records from {units_total} unit(s)"),
        );
        event.units_total = Some(units_total);
        let _ = self.sender.send(event);
    }

    /// Reports that all units reached a terminal state.
    pub fn consolidating(&self, units_completed: u32, units_total: u32) {
        let mut event = ProgressEvent::new(
            &self.job_id,
            &self.filename,
            JobPhase::Consolidating,
            &format!("Consolidating {units_completed}/{units_total} unit(s)"),
        );
        event.units_total = Some(units_total);
        event.units_completed = Some(units_completed);
        let _ = self.sender.send(event);
    }

    /// Marks the job as completed.
    pub fn completed(&self, message: &str) {
        let event = ProgressEvent::completed(&self.job_id, &self.filename, message);
        let _ = self.sender.send(event);
    }

    /// Marks the job as failed with an error message.
    pub fn failed(&self, error: &str) {
        let event = ProgressEvent::failed(&self.job_id, &self.filename, error);
        let _ = self.sender.send(event);
    }
}
