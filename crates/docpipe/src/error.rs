use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("No data directory available and no database path configured")]
    NoDataDir,
}

/// Synchronous rejection of a processing request. Nothing is enqueued when
/// one of these is returned.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    #[error("No output profile for tenant '{tenant_id}' category {category_id}: {reason}")]
    Configuration {
        tenant_id: String,
        category_id: u32,
        reason: String,
    },

    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    #[error("Job queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Engine is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("No default output profile for category {category_id}")]
    MissingDefault { category_id: u32 },

    #[error("Profile '{profile_id}' declares no output formats")]
    NoFormats { profile_id: String },

    #[error("Profile '{profile_id}' declares no fields")]
    NoFields { profile_id: String },

    #[error("Invalid regex in transform for field '{field}': {reason}")]
    InvalidPattern { field: String, reason: String },

    #[error("Profile store lookup failed: {0}")]
    Store(String),
}

/// Per-unit extraction failures. `Transient` and `Timeout` are retried
/// with backoff; everything else fails the unit on the spot.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Transient failure: {reason}")]
    Transient { reason: String },

    #[error("Fatal failure: {reason}")]
    Fatal { reason: String },

    #[error("Call exceeded {timeout_secs}s timeout")]
    Timeout { timeout_secs: u64 },

    #[error("Job deadline exceeded before unit completed")]
    JobDeadline,

    #[error("Source document is unreadable: {reason}")]
    UnreadableSource { reason: String },

    #[error("Source document has zero pages")]
    ZeroPages,
}

impl ExtractError {
    /// Whether the worker pool should schedule another attempt for this
    /// failure. Timeouts count as transient per the blocking-with-timeout
    /// call model.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractError::Transient { .. } | ExtractError::Timeout { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("CSV rendering failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON rendering failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML rendering failed: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XLSX rendering failed: {0}")]
    Xlsx(#[from] zip::result::ZipError),

    #[error("Rendered output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("I/O error while rendering: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Webhook transport failed: {reason}")]
    Transport { reason: String },

    #[error("Webhook returned HTTP {status}")]
    Status { status: u16 },

    #[error("Delivery exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Delivery endpoint is not configured")]
    NoEndpoint,
}

pub type Result<T> = std::result::Result<T, DocpipeError>;
