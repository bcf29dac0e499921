pub mod loader;
pub mod schema;

pub use loader::{default_database_path, load_settings, load_settings_from_env, load_settings_from_str};
pub use schema::{
    DeliveryConfig, ExtractionConfig, JobConfig, Settings, SplitConfig, WorkerConfig,
};
