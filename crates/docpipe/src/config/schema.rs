//! Settings schema.
//!
//! Every field has a serde default so a partial YAML file (or none at all)
//! yields a working configuration; `validate()` reports every problem at
//! once instead of failing on the first.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::Deserialize;

use crate::cost::PricingTable;
use crate::error::ConfigError;

#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub pricing: PricingTable,
    /// SQLite database location. `None` resolves to the platform data
    /// directory at engine start.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitConfig {
    /// Maximum pages per unit.
    #[serde(default = "default_pages_per_unit")]
    pub pages_per_unit: u32,
}

fn default_pages_per_unit() -> u32 {
    15
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            pages_per_unit: default_pages_per_unit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Unit-level parallelism within one job.
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,
    /// Number of threads consuming the job queue.
    #[serde(default = "default_job_runners")]
    pub job_runners: usize,
    /// Bound of the job queue; intake rejects once full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_parallel_workers() -> usize {
    8
}

fn default_job_runners() -> usize {
    // Jobs are network-bound; a couple of runners keeps the queue moving
    // without oversubscribing small hosts.
    2.min(num_cpus::get().max(1))
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_parallel_workers: default_max_parallel_workers(),
            job_runners: default_job_runners(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Attempts per unit before it is marked failed.
    #[serde(default = "default_extraction_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_extraction_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_extraction_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Budget for one OCR or LLM call; exceeding it counts as a transient
    /// failure.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_extraction_attempts() -> u32 {
    3
}

fn default_extraction_backoff_base() -> u64 {
    2
}

fn default_extraction_backoff_cap() -> u64 {
    60
}

fn default_call_timeout() -> u64 {
    300
}

impl ExtractionConfig {
    /// The per-call budget handed to the OCR and extraction collaborators.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_extraction_attempts(),
            backoff_base_secs: default_extraction_backoff_base(),
            backoff_cap_secs: default_extraction_backoff_cap(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeliveryConfig {
    /// Webhook URL results are posted to. Required for delivery; jobs
    /// without an endpoint finalize but skip the callback.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Optional bearer token sent with every delivery.
    #[serde(default)]
    pub auth_token: Option<SecretString>,
    #[serde(default = "default_delivery_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delivery_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_delivery_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Budget for one webhook POST.
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
}

fn default_delivery_attempts() -> u32 {
    10
}

fn default_delivery_backoff_base() -> u64 {
    60
}

fn default_delivery_backoff_cap() -> u64 {
    960
}

fn default_delivery_timeout() -> u64 {
    30
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            max_attempts: default_delivery_attempts(),
            backoff_base_secs: default_delivery_backoff_base(),
            backoff_cap_secs: default_delivery_backoff_cap(),
            timeout_secs: default_delivery_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Wall-clock budget per job, measured from `started_at`. Units still
    /// pending or running at the deadline are failed with a timeout error.
    #[serde(default = "default_job_timeout")]
    pub timeout_secs: u64,
}

fn default_job_timeout() -> u64 {
    1800
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_job_timeout(),
        }
    }
}

impl Settings {
    /// Checks cross-field invariants, reporting all violations in one
    /// message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.split.pages_per_unit == 0 {
            issues.push("split.pages_per_unit must be at least 1".to_string());
        }
        if self.workers.max_parallel_workers == 0 {
            issues.push("workers.max_parallel_workers must be at least 1".to_string());
        }
        if self.workers.job_runners == 0 {
            issues.push("workers.job_runners must be at least 1".to_string());
        }
        if self.workers.queue_capacity == 0 {
            issues.push("workers.queue_capacity must be at least 1".to_string());
        }
        if self.extraction.max_attempts == 0 {
            issues.push("extraction.max_attempts must be at least 1".to_string());
        }
        if self.delivery.max_attempts == 0 {
            issues.push("delivery.max_attempts must be at least 1".to_string());
        }
        if self.job.timeout_secs == 0 {
            issues.push("job.timeout_secs must be at least 1".to_string());
        }
        if let Some(endpoint) = &self.delivery.endpoint {
            if endpoint.trim().is_empty() {
                issues.push("delivery.endpoint must not be blank when set".to_string());
            }
        }
        if self.pricing.ocr_per_page < Decimal::ZERO {
            issues.push("pricing.ocr_per_page must not be negative".to_string());
        }
        for (model, rates) in &self.pricing.models {
            if rates.input_per_1k < Decimal::ZERO || rates.output_per_1k < Decimal::ZERO {
                issues.push(format!("pricing.models.{model} rates must not be negative"));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation {
                message: issues.join("; "),
            })
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.extraction.call_timeout()
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.split.pages_per_unit, 15);
        assert_eq!(settings.workers.max_parallel_workers, 8);
        assert_eq!(settings.extraction.max_attempts, 3);
        assert_eq!(settings.delivery.max_attempts, 10);
        assert_eq!(settings.job.timeout_secs, 1800);
    }

    #[test]
    fn partial_yaml_fills_remaining_defaults() {
        let settings: Settings = serde_yaml::from_str(
            r#"
            split:
              pages_per_unit: 10
            delivery:
              endpoint: "https://example.test/callback"
            "#,
        )
        .unwrap();

        assert_eq!(settings.split.pages_per_unit, 10);
        assert_eq!(settings.workers.max_parallel_workers, 8);
        assert_eq!(
            settings.delivery.endpoint.as_deref(),
            Some("https://example.test/callback")
        );
        assert_eq!(settings.delivery.max_attempts, 10);
    }

    #[test]
    fn validation_collects_every_issue() {
        let mut settings = Settings::default();
        settings.split.pages_per_unit = 0;
        settings.extraction.max_attempts = 0;
        settings.delivery.endpoint = Some("   ".to_string());

        let err = settings.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("pages_per_unit"));
        assert!(message.contains("extraction.max_attempts"));
        assert!(message.contains("delivery.endpoint"));
    }

    #[test]
    fn pricing_overrides_deserialize_as_decimals() {
        let settings: Settings = serde_yaml::from_str(
            r#"
            pricing:
              ocr_per_page: "0.02"
              default_model: custom-model
              models:
                custom-model:
                  input_per_1k: "0.001"
                  output_per_1k: "0.002"
            "#,
        )
        .unwrap();

        assert_eq!(
            settings.pricing.ocr_per_page,
            "0.02".parse::<Decimal>().unwrap()
        );
        assert_eq!(settings.pricing.default_model, "custom-model");
    }
}
