//! Settings loading: YAML file, then environment overrides, then
//! validation.

use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::config::schema::Settings;
use crate::error::ConfigError;

/// Environment variables recognized on top of the file. Deployment-varying
/// values only; everything else belongs in the file.
const ENV_DELIVERY_URL: &str = "DOCPIPE_DELIVERY_URL";
const ENV_DELIVERY_TOKEN: &str = "DOCPIPE_DELIVERY_TOKEN";
const ENV_DATABASE_PATH: &str = "DOCPIPE_DATABASE_PATH";

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    load_settings_from_str(&content)
}

pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let mut settings: Settings = serde_yaml::from_str(content)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults plus environment overrides, for deployments that run without a
/// settings file at all.
pub fn load_settings_from_env() -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(url) = std::env::var(ENV_DELIVERY_URL) {
        settings.delivery.endpoint = Some(url);
    }
    if let Ok(token) = std::env::var(ENV_DELIVERY_TOKEN) {
        settings.delivery.auth_token = Some(SecretString::from(token));
    }
    if let Ok(path) = std::env::var(ENV_DATABASE_PATH) {
        settings.database_path = Some(PathBuf::from(path));
    }
}

/// Platform-default database location, used when `database_path` is unset.
pub fn default_database_path() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
    Ok(base.join("docpipe").join("jobs.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use serial_test::serial;

    #[test]
    fn loads_settings_file() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("docpipe.yaml");
        file.write_str(
            r#"
            split:
              pages_per_unit: 20
            workers:
              max_parallel_workers: 4
            "#,
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.split.pages_per_unit, 20);
        assert_eq!(settings.workers.max_parallel_workers, 4);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_settings("/nonexistent/docpipe.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn invalid_yaml_is_a_parse_error() {
        let err = load_settings_from_str("split: [not, a, mapping").unwrap_err();
        assert!(matches!(err, ConfigError::ParseYaml(_)));
    }

    #[test]
    #[serial]
    fn env_overrides_take_precedence_over_file() {
        std::env::set_var(ENV_DELIVERY_URL, "https://env.test/hook");
        std::env::set_var(ENV_DATABASE_PATH, "/tmp/docpipe-test.db");

        let settings = load_settings_from_str(
            r#"
            delivery:
              endpoint: "https://file.test/hook"
            "#,
        )
        .unwrap();

        std::env::remove_var(ENV_DELIVERY_URL);
        std::env::remove_var(ENV_DATABASE_PATH);

        assert_eq!(
            settings.delivery.endpoint.as_deref(),
            Some("https://env.test/hook")
        );
        assert_eq!(
            settings.database_path,
            Some(PathBuf::from("/tmp/docpipe-test.db"))
        );
    }

    #[test]
    #[serial]
    fn env_only_settings_validate() {
        std::env::remove_var(ENV_DELIVERY_URL);
        std::env::remove_var(ENV_DELIVERY_TOKEN);
        std::env::remove_var(ENV_DATABASE_PATH);

        let settings = load_settings_from_env().unwrap();
        assert!(settings.delivery.endpoint.is_none());
    }
}
