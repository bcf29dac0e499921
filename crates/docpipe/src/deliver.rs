//! Webhook delivery of finalized results.
//!
//! Delivery starts only after the job reached a terminal status, and its
//! outcome never feeds back: a Processed job stays Processed even when every
//! webhook attempt fails. Each attempt is persisted through
//! [`delivery_repo`] so a restart can see which jobs still owe the caller a
//! callback.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::clock::{backoff_delay, Clock};
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::job::{Job, JobStatus};
use crate::store::delivery_repo::{self, DeliveryAttemptRow};
use crate::store::{Database, StoreError};

/// Delivery state for one job, as of the most recent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Exhausted,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "Pending",
            DeliveryStatus::Delivered => "Delivered",
            DeliveryStatus::Exhausted => "Exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(DeliveryStatus::Pending),
            "Delivered" => Some(DeliveryStatus::Delivered),
            "Exhausted" => Some(DeliveryStatus::Exhausted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Webhook body POSTed to the caller. Built from the finalized job row, so a
/// restart can reconstruct it for deliveries that are still owed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub job_id: String,
    pub status: JobStatus,
    pub document_ai_cost: Decimal,
    pub llm_cost: Decimal,
    pub total_cost: Decimal,
    pub total_records: u64,
    pub page_count: u32,
    pub output_file_references: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_processing_time_seconds: Option<f64>,
}

impl DeliveryPayload {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            document_ai_cost: job.ocr_cost,
            llm_cost: job.llm_cost,
            total_cost: job.total_cost,
            total_records: job.record_count,
            page_count: job.page_count,
            output_file_references: job.output_file_references.clone(),
            error_message: job.error_summary.clone(),
            total_processing_time_seconds: job.processing_time_seconds(),
        }
    }
}

/// One webhook POST. `Ok(())` means the endpoint acknowledged with a 2xx;
/// anything else is an error the retry loop decides what to do with.
pub trait DeliveryTransport: Send + Sync {
    fn post(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError>;
}

/// Connect budget for the webhook client; the per-request budget comes from
/// configuration.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP transport POSTing JSON to the configured endpoint, with an optional
/// bearer token.
#[derive(Debug)]
pub struct WebhookTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    auth_token: Option<SecretString>,
}

impl WebhookTransport {
    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let endpoint = config.endpoint.clone().ok_or(DeliveryError::NoEndpoint)?;
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DeliveryError::Transport {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            endpoint,
            auth_token: config.auth_token.clone(),
        })
    }
}

impl DeliveryTransport for WebhookTransport {
    fn post(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.endpoint).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().map_err(|e| DeliveryError::Transport {
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                status: status.as_u16(),
            })
        }
    }
}

/// Drives the attempt loop for one job's callback, blocking between
/// attempts. Every attempt is written to the store before and after the
/// POST, so the latest row always reflects the delivery's current state.
pub struct DeliveryClient {
    transport: Arc<dyn DeliveryTransport>,
    clock: Arc<dyn Clock>,
    db: Database,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl DeliveryClient {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        clock: Arc<dyn Clock>,
        db: Database,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            transport,
            clock,
            db,
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    /// Runs attempts until the webhook acknowledges or the attempt budget is
    /// spent. Returns the terminal [`DeliveryStatus`]; store failures bubble
    /// up because losing the attempt trail would make restarts re-deliver
    /// blindly.
    pub fn deliver(&self, payload: &DeliveryPayload) -> Result<DeliveryStatus, StoreError> {
        for attempt in 1..=self.max_attempts {
            let mut row = DeliveryAttemptRow {
                job_id: payload.job_id.clone(),
                attempt_number: attempt,
                scheduled_at: self.clock.now(),
                status: DeliveryStatus::Pending,
                last_error: None,
            };
            delivery_repo::record(&self.db, &row)?;

            match self.transport.post(payload) {
                Ok(()) => {
                    log::info!(
                        "Delivered results for job '{}' on attempt {attempt}",
                        payload.job_id
                    );
                    row.status = DeliveryStatus::Delivered;
                    delivery_repo::record(&self.db, &row)?;
                    return Ok(DeliveryStatus::Delivered);
                }
                Err(err) if attempt < self.max_attempts => {
                    let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempt);
                    log::warn!(
                        "Delivery attempt {attempt}/{} for job '{}' failed: {err}; retrying in {}s",
                        self.max_attempts,
                        payload.job_id,
                        delay.as_secs()
                    );
                    row.last_error = Some(err.to_string());
                    delivery_repo::record(&self.db, &row)?;
                    self.clock.sleep(delay);
                }
                Err(err) => {
                    log::error!(
                        "Delivery for job '{}' exhausted after {} attempts: {err}",
                        payload.job_id,
                        self.max_attempts
                    );
                    row.status = DeliveryStatus::Exhausted;
                    row.last_error = Some(err.to_string());
                    delivery_repo::record(&self.db, &row)?;
                    return Ok(DeliveryStatus::Exhausted);
                }
            }
        }

        unreachable!("attempt loop always returns on the final attempt");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::clock::ManualClock;
    use crate::job::IntakeRequest;

    /// Transport scripted with per-call outcomes; calls beyond the script
    /// succeed.
    #[derive(Default)]
    struct ScriptedTransport {
        outcomes: Mutex<Vec<Result<(), DeliveryError>>>,
        payloads: Mutex<Vec<DeliveryPayload>>,
    }

    impl ScriptedTransport {
        fn failing_with(outcomes: Vec<DeliveryError>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().map(Err).collect()),
                payloads: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    impl DeliveryTransport for ScriptedTransport {
        fn post(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
            self.payloads.lock().unwrap().push(payload.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn finalized_job() -> Job {
        let request = IntakeRequest {
            job_id: "job-1".to_string(),
            tenant_id: "acme".to_string(),
            category_id: 7,
            source_file_reference: "uploads/invoice.pdf".to_string(),
            original_filename: "invoice.pdf".to_string(),
            model_hint: None,
        };
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut job = Job::from_request(&request, "profile-1", started);
        job.status = JobStatus::Processed;
        job.page_count = 45;
        job.record_count = 12;
        job.ocr_cost = Decimal::new(45, 2);
        job.llm_cost = Decimal::new(3, 2);
        job.total_cost = Decimal::new(48, 2);
        job.output_file_references = vec!["mem://invoice_job-1.csv".to_string()];
        job.error_summary = Some("pages 16-30: rate limited".to_string());
        job.finished_at = Some(started + chrono::Duration::seconds(150));
        job
    }

    fn client_with(
        transport: Arc<ScriptedTransport>,
        max_attempts: u32,
    ) -> (DeliveryClient, Database, Arc<ManualClock>) {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
        ));
        let config = DeliveryConfig {
            endpoint: Some("https://example.test/callback".to_string()),
            max_attempts,
            backoff_base_secs: 60,
            backoff_cap_secs: 960,
            ..DeliveryConfig::default()
        };
        let client = DeliveryClient::new(transport, clock.clone(), db.clone(), &config);
        (client, db, clock)
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Exhausted,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("Sent"), None);
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }

    #[test]
    fn payload_mirrors_the_finalized_job() {
        let payload = DeliveryPayload::from_job(&finalized_job());
        assert_eq!(payload.job_id, "job-1");
        assert_eq!(payload.status, JobStatus::Processed);
        assert_eq!(payload.document_ai_cost, Decimal::new(45, 2));
        assert_eq!(payload.total_cost, Decimal::new(48, 2));
        assert_eq!(payload.total_records, 12);
        assert_eq!(payload.total_processing_time_seconds, Some(150.0));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["documentAiCost"], "0.45");
        assert_eq!(json["totalCost"], "0.48");
        assert_eq!(json["pageCount"], 45);
        assert_eq!(json["errorMessage"], "pages 16-30: rate limited");
        assert_eq!(json["totalProcessingTimeSeconds"], 150.0);
    }

    #[test]
    fn first_attempt_success_is_delivered_without_sleeping() {
        let transport = Arc::new(ScriptedTransport::default());
        let (client, db, clock) = client_with(transport.clone(), 10);

        let status = client
            .deliver(&DeliveryPayload::from_job(&finalized_job()))
            .unwrap();

        assert_eq!(status, DeliveryStatus::Delivered);
        assert_eq!(transport.calls(), 1);
        assert!(clock.recorded_sleeps().is_empty());

        let attempts = delivery_repo::list_for_job(&db, "job-1").unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, DeliveryStatus::Delivered);
        assert!(attempts[0].last_error.is_none());
    }

    #[test]
    fn failures_back_off_and_eventually_deliver() {
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            DeliveryError::Status { status: 500 },
            DeliveryError::Transport {
                reason: "connection reset".to_string(),
            },
        ]));
        let (client, db, clock) = client_with(transport.clone(), 10);

        let status = client
            .deliver(&DeliveryPayload::from_job(&finalized_job()))
            .unwrap();

        assert_eq!(status, DeliveryStatus::Delivered);
        assert_eq!(transport.calls(), 3);
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );

        let attempts = delivery_repo::list_for_job(&db, "job-1").unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].status, DeliveryStatus::Pending);
        assert!(attempts[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("HTTP 500"));
        assert_eq!(attempts[2].status, DeliveryStatus::Delivered);
    }

    #[test]
    fn attempt_budget_exhausts_with_the_last_error_recorded() {
        let transport = Arc::new(ScriptedTransport::failing_with(vec![
            DeliveryError::Status { status: 500 },
            DeliveryError::Status { status: 502 },
            DeliveryError::Status { status: 503 },
        ]));
        let (client, db, clock) = client_with(transport.clone(), 3);

        let status = client
            .deliver(&DeliveryPayload::from_job(&finalized_job()))
            .unwrap();

        assert_eq!(status, DeliveryStatus::Exhausted);
        assert_eq!(transport.calls(), 3);
        // No sleep after the final attempt.
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );

        let attempts = delivery_repo::list_for_job(&db, "job-1").unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].status, DeliveryStatus::Exhausted);
        assert!(attempts[2]
            .last_error
            .as_deref()
            .unwrap()
            .contains("HTTP 503"));
    }

    #[test]
    fn mid_retry_state_reads_as_still_pending() {
        let transport = Arc::new(ScriptedTransport::failing_with(vec![DeliveryError::Status {
            status: 500,
        }]));
        let (client, db, _clock) = client_with(transport, 10);

        client
            .deliver(&DeliveryPayload::from_job(&finalized_job()))
            .unwrap();

        // Attempt 1 failed and stays Pending in the trail; the latest row is
        // what the restart scan looks at.
        let attempts = delivery_repo::list_for_job(&db, "job-1").unwrap();
        assert_eq!(attempts[0].status, DeliveryStatus::Pending);
        assert_eq!(attempts[1].status, DeliveryStatus::Delivered);
        assert!(delivery_repo::jobs_with_pending_delivery(&db)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn transport_requires_an_endpoint() {
        let config = DeliveryConfig::default();
        let err = WebhookTransport::from_config(&config).unwrap_err();
        assert!(matches!(err, DeliveryError::NoEndpoint));
    }
}
