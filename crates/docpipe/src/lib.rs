pub mod clock;
pub mod collab;
pub mod config;
pub mod consolidate;
pub mod cost;
pub mod deliver;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod pool;
pub mod profile;
pub mod progress;
pub mod record;
pub mod render;
pub mod service;
pub mod split;
pub mod store;
pub mod telemetry;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collab::{
    ExtractionRequest, MemoryObjectStore, ObjectStore, ObjectStoreError, OcrEngine, OcrText,
    ProfileStore, RawExtraction, RawRecord, RecordExtractor, StaticProfileStore,
};
pub use config::{load_settings, load_settings_from_env, Settings};
pub use deliver::{DeliveryPayload, DeliveryStatus, DeliveryTransport, WebhookTransport};
pub use error::{
    ConfigError, DeliveryError, DocpipeError, ExtractError, IntakeError, ProfileError,
    RenderError, Result,
};
pub use job::{IntakeRequest, Job, JobStatus};
pub use profile::{FieldKind, FieldSpec, FieldTransform, OutputFormat, OutputProfile};
pub use progress::{JobPhase, ProgressEvent};
pub use render::RenderedOutput;
pub use service::{Collaborators, Engine};
pub use split::PageRange;
pub use tracker::JobFilter;
