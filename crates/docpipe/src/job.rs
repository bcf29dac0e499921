//! Job model and intake request.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::IntakeError;

/// Processing status of a job. Terminal states are never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    InProgress,
    Processed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "InProgress",
            JobStatus::Processed => "Processed",
            JobStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "InProgress" => Some(JobStatus::InProgress),
            "Processed" => Some(JobStatus::Processed),
            "Failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One processing request as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeRequest {
    pub job_id: String,
    pub tenant_id: String,
    pub category_id: u32,
    /// Object-store reference of the uploaded source document.
    pub source_file_reference: String,
    pub original_filename: String,
    /// Preferred extraction model; forwarded to the LLM collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
}

impl IntakeRequest {
    /// Payload-shape validation, performed synchronously at intake. Checks
    /// only what is knowable without touching a collaborator.
    pub fn validate(&self) -> Result<(), IntakeError> {
        fn required(name: &str, value: &str) -> Result<(), IntakeError> {
            if value.trim().is_empty() {
                return Err(IntakeError::Validation {
                    reason: format!("{name} must not be empty"),
                });
            }
            Ok(())
        }

        required("jobId", &self.job_id)?;
        required("tenantId", &self.tenant_id)?;
        required("sourceFileReference", &self.source_file_reference)?;
        required("originalFilename", &self.original_filename)?;
        if let Some(hint) = &self.model_hint {
            required("modelHint", hint)?;
        }
        Ok(())
    }

    /// Filename stem used for naming rendered outputs.
    pub fn filename_stem(&self) -> &str {
        filename_stem(&self.original_filename)
    }
}

/// Strips the last extension; dot-files and extensionless names pass
/// through whole.
pub(crate) fn filename_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// One document-processing request with everything the tracker persists.
/// Mutated only through the [`JobTracker`](crate::tracker::JobTracker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub tenant_id: String,
    pub category_id: u32,
    pub status: JobStatus,
    pub source_file_reference: String,
    pub original_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hint: Option<String>,
    /// Resolved output profile used for this job.
    pub profile_id: String,
    pub page_count: u32,
    pub unit_count: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub ocr_cost: Decimal,
    pub llm_cost: Decimal,
    pub total_cost: Decimal,
    pub record_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    /// Object-store references of the rendered outputs, one per format.
    #[serde(default)]
    pub output_file_references: Vec<String>,
}

impl Job {
    /// New in-progress job for an accepted request.
    pub fn from_request(request: &IntakeRequest, profile_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: request.job_id.clone(),
            tenant_id: request.tenant_id.clone(),
            category_id: request.category_id,
            status: JobStatus::InProgress,
            source_file_reference: request.source_file_reference.clone(),
            original_filename: request.original_filename.clone(),
            model_hint: request.model_hint.clone(),
            profile_id: profile_id.to_string(),
            page_count: 0,
            unit_count: 0,
            started_at: now,
            finished_at: None,
            ocr_cost: Decimal::ZERO,
            llm_cost: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            record_count: 0,
            error_summary: None,
            output_file_references: Vec::new(),
        }
    }

    /// Filename stem used for naming rendered outputs.
    pub fn filename_stem(&self) -> &str {
        filename_stem(&self.original_filename)
    }

    /// Wall-clock processing time; `None` until the job is terminal.
    pub fn processing_time_seconds(&self) -> Option<f64> {
        let finished = self.finished_at?;
        let millis = (finished - self.started_at).num_milliseconds();
        Some((millis.max(0) as f64) / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> IntakeRequest {
        IntakeRequest {
            job_id: "job-1".to_string(),
            tenant_id: "acme".to_string(),
            category_id: 1,
            source_file_reference: "uploads/claim.pdf".to_string(),
            original_filename: "claim.pdf".to_string(),
            model_hint: None,
        }
    }

    #[test]
    fn valid_request_passes() {
        request().validate().unwrap();
    }

    #[test]
    fn blank_fields_are_rejected() {
        for field in ["job_id", "tenant_id", "source", "filename"] {
            let mut r = request();
            match field {
                "job_id" => r.job_id = "  ".to_string(),
                "tenant_id" => r.tenant_id = String::new(),
                "source" => r.source_file_reference = String::new(),
                _ => r.original_filename = " ".to_string(),
            }
            let err = r.validate().unwrap_err();
            assert!(matches!(err, IntakeError::Validation { .. }), "{field}");
        }
    }

    #[test]
    fn filename_stem_strips_only_the_last_extension() {
        let mut r = request();
        assert_eq!(r.filename_stem(), "claim");
        r.original_filename = "scan.2024.03.pdf".to_string();
        assert_eq!(r.filename_stem(), "scan.2024.03");
        r.original_filename = "no_extension".to_string();
        assert_eq!(r.filename_stem(), "no_extension");
        r.original_filename = ".hidden".to_string();
        assert_eq!(r.filename_stem(), ".hidden");
    }

    #[test]
    fn new_job_starts_in_progress() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let job = Job::from_request(&request(), "profile-1", now);
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.started_at, now);
        assert!(job.finished_at.is_none());
        assert_eq!(job.total_cost, Decimal::ZERO);
        assert!(job.processing_time_seconds().is_none());
    }

    #[test]
    fn processing_time_uses_finished_at() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut job = Job::from_request(&request(), "profile-1", start);
        job.finished_at = Some(start + chrono::Duration::milliseconds(2500));
        assert_eq!(job.processing_time_seconds(), Some(2.5));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [JobStatus::InProgress, JobStatus::Processed, JobStatus::Failed] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("unknown"), None);
        assert!(JobStatus::Processed.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }
}
