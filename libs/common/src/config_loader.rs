//! Configuration loading helper functions
//!
//! Services describe their configuration as serde structs. A file (format
//! chosen by extension) is merged with prefixed environment variables; nested
//! keys use `__`, e.g. `NETSRV_LOGGING__DIRECTORY`.

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Config file must have an extension: {0}")]
    MissingExtension(PathBuf),

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to load configuration from {path}: {source}")]
    Extract {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },
}

/// Load configuration from a specific file
///
/// Priority (highest to lowest):
/// 1. Environment variables starting with `env_prefix`
/// 2. The config file
/// 3. Serde defaults
pub fn load_config_from_file<T, P>(path: P, env_prefix: Option<&str>) -> Result<T, ConfigLoadError>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.to_path_buf()));
    }
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ConfigLoadError::MissingExtension(path.to_path_buf()))?;

    let mut figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        other => return Err(ConfigLoadError::UnsupportedFormat(other.to_string())),
    };
    if let Some(prefix) = env_prefix {
        figment = figment.merge(Env::prefixed(prefix).split("__"));
    }

    let config = figment.extract().map_err(|e| ConfigLoadError::Extract {
        path: path.to_path_buf(),
        source: Box::new(e),
    })?;
    info!("Configuration loaded from {}", path.display());
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs;

    #[derive(Debug, Deserialize, PartialEq)]
    struct TestConfig {
        name: String,
        #[serde(default)]
        nested: NestedConfig,
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct NestedConfig {
        #[serde(default)]
        port: u16,
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.yaml");
        fs::write(&path, "name: logger\nnested:\n  port: 1883\n").unwrap();

        let config: TestConfig = load_config_from_file(&path, None).unwrap();
        assert_eq!(config.name, "logger");
        assert_eq!(config.nested.port, 1883);
    }

    #[test]
    fn test_load_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.toml");
        fs::write(&path, "name = \"driver\"\n").unwrap();

        let config: TestConfig = load_config_from_file(&path, None).unwrap();
        assert_eq!(config.nested, NestedConfig::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.json");
        fs::write(&path, r#"{"name": "file", "nested": {"port": 1}}"#).unwrap();

        std::env::set_var("CFGLOADERTEST_NESTED__PORT", "8883");
        let config: TestConfig = load_config_from_file(&path, Some("CFGLOADERTEST_")).unwrap();
        std::env::remove_var("CFGLOADERTEST_NESTED__PORT");

        assert_eq!(config.name, "file");
        assert_eq!(config.nested.port, 8883);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.ini");
        fs::write(&path, "name=x").unwrap();

        let result: Result<TestConfig, _> = load_config_from_file(&path, None);
        assert!(matches!(result, Err(ConfigLoadError::UnsupportedFormat(ext)) if ext == "ini"));
    }

    #[test]
    fn test_missing_file() {
        let result: Result<TestConfig, _> = load_config_from_file("/nonexistent/svc.yaml", None);
        assert!(matches!(result, Err(ConfigLoadError::NotFound(_))));
    }

    #[test]
    fn test_invalid_content_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.yaml");
        fs::write(&path, "nested:\n  port: not-a-number\n").unwrap();

        let err = load_config_from_file::<TestConfig, _>(&path, None).unwrap_err();
        assert!(err.to_string().contains("svc.yaml"));
    }
}
