use std::path::Path;

use crate::config::schema::{CloudMaskingMode, Config};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    let endpoint = &config.stac.endpoint;
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(invalid("stac.endpoint must be an http(s) URL"));
    }
    if config.stac.collections.is_empty() {
        return Err(invalid("stac.collections must name at least one collection"));
    }
    if config.stac.page_size == 0 || config.stac.max_pages == 0 || config.stac.timeout_secs == 0 {
        return Err(invalid(
            "stac.page_size, stac.max_pages and stac.timeout_secs must be positive",
        ));
    }

    let pre = &config.preprocessing;
    if !(pre.quantification.is_finite() && pre.quantification > 0.0) {
        return Err(invalid("preprocessing.quantification must be positive"));
    }
    if !(0.0..50.0).contains(&pre.haze_percentile) {
        return Err(invalid("preprocessing.haze_percentile must be within [0, 50)"));
    }
    for (name, value) in [
        ("cloud_blue_threshold", pre.cloud_blue_threshold),
        ("cloud_brightness_threshold", pre.cloud_brightness_threshold),
    ] {
        if !(value > 0.0 && value <= 1.0) {
            return Err(invalid(format!(
                "preprocessing.{} must be within (0, 1], got {}",
                name, value
            )));
        }
    }
    if pre.strip_rows == 0 {
        return Err(invalid("preprocessing.strip_rows must be positive"));
    }
    if pre.cloud_masking == CloudMaskingMode::Remote && config.inference.is_none() {
        return Err(invalid(
            "remote cloud masking requires an inference section",
        ));
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if !(retry.multiplier.is_finite() && retry.multiplier >= 1.0) {
        return Err(invalid("retry.multiplier must be at least 1.0"));
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        return Err(invalid(
            "retry.max_backoff_ms must not be smaller than retry.initial_backoff_ms",
        ));
    }

    if config.workers.max_concurrent_scenes == 0 || config.workers.max_concurrent_jobs == 0 {
        return Err(invalid("worker limits must be positive"));
    }

    if let Some(search) = &config.search {
        if !search.bbox.is_valid() {
            return Err(invalid("search.bbox is not a valid WGS84 box"));
        }
        if search.start > search.end {
            return Err(invalid("search.start must not be after search.end"));
        }
        if !(0.0..=100.0).contains(&search.max_cloud_cover) {
            return Err(invalid("search.max_cloud_cover must be within [0, 100]"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
    {
        "version": "1.0",
        "stac": { "endpoint": "https://earth-search.example/v1" }
    }
    "#;

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let config = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.stac.provider, "stac");
        assert_eq!(config.stac.collections, vec!["sentinel-2-l2a".to_string()]);
        assert_eq!(config.preprocessing.cloud_masking, CloudMaskingMode::Spectral);
        assert_eq!(config.preprocessing.quantification, 10_000.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.workers.max_concurrent_scenes >= 1);
        assert!(config.inference.is_none());
        assert!(config.search.is_none());
        assert!(config.database_file().ends_with("terrascan.db"));
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "data_directory": "/var/lib/terrascan",
            "database_path": "/var/lib/terrascan/catalog.db",
            "stac": {
                "endpoint": "https://earth-search.example/v1",
                "provider": "earth-search",
                "collections": ["sentinel-2-l2a", "landsat-c2-l2"],
                "auth": { "tokenEnvVar": "STAC_TOKEN" },
                "page_size": 50,
                "max_pages": 4
            },
            "inference": {
                "endpoint": "http://models.internal:8080",
                "auth": { "token": "secret" }
            },
            "preprocessing": {
                "cloud_masking": "remote",
                "radiometric_offset": -1000,
                "haze_percentile": 0.5,
                "strip_rows": 64
            },
            "retry": { "max_attempts": 5, "initial_backoff_ms": 100, "multiplier": 3.0, "max_backoff_ms": 2000 },
            "workers": { "max_concurrent_scenes": 2, "max_concurrent_jobs": 8 },
            "logging": { "level": "debug", "format": "json" },
            "search": {
                "bbox": { "min_lon": 5.9, "min_lat": 45.8, "max_lon": 10.5, "max_lat": 47.8 },
                "start": "2026-06-01T00:00:00Z",
                "end": "2026-06-30T23:59:59Z",
                "max_cloud_cover": 20,
                "limit": 10
            }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.stac.provider, "earth-search");
        assert_eq!(config.stac.auth.token_env_var.as_deref(), Some("STAC_TOKEN"));
        assert_eq!(config.preprocessing.cloud_masking, CloudMaskingMode::Remote);
        assert_eq!(config.preprocessing.radiometric_offset, -1000.0);
        assert_eq!(config.preprocessing.strip_rows, 64);
        assert_eq!(config.workers.max_concurrent_jobs, 8);
        assert_eq!(config.logging.format, crate::config::LogFormat::Json);
        assert_eq!(
            config.database_file(),
            std::path::PathBuf::from("/var/lib/terrascan/catalog.db")
        );

        let search = config.search.unwrap();
        let query = search.to_query(&config.stac.collections);
        assert_eq!(query.collections.len(), 2);
        assert_eq!(query.max_cloud_cover, 20.0);
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn test_invalid_version() {
        let config_json = MINIMAL.replace("1.0", "2.0");
        assert!(matches!(
            load_config_from_str(&config_json),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_schema_rejects_missing_stac() {
        let result = load_config_from_str(r#"{ "version": "1.0" }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_schema_rejects_unknown_masking_mode() {
        let config_json = r#"
        {
            "version": "1.0",
            "stac": { "endpoint": "https://earth-search.example/v1" },
            "preprocessing": { "cloud_masking": "magic" }
        }
        "#;
        assert!(matches!(
            load_config_from_str(config_json),
            Err(ConfigError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn test_remote_masking_requires_inference() {
        let config_json = r#"
        {
            "version": "1.0",
            "stac": { "endpoint": "https://earth-search.example/v1" },
            "preprocessing": { "cloud_masking": "remote" }
        }
        "#;
        assert!(matches!(
            load_config_from_str(config_json),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let config_json = r#"
        {
            "version": "1.0",
            "stac": { "endpoint": "https://earth-search.example/v1" },
            "retry": { "initial_backoff_ms": 5000, "max_backoff_ms": 100 }
        }
        "#;
        assert!(load_config_from_str(config_json).is_err());
    }

    #[test]
    fn test_inverted_search_window() {
        let config_json = r#"
        {
            "version": "1.0",
            "stac": { "endpoint": "https://earth-search.example/v1" },
            "search": {
                "bbox": { "min_lon": 0, "min_lat": 0, "max_lon": 1, "max_lat": 1 },
                "start": "2026-07-01T00:00:00Z",
                "end": "2026-06-01T00:00:00Z"
            }
        }
        "#;
        assert!(load_config_from_str(config_json).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terrascan.json");
        std::fs::write(&path, MINIMAL).unwrap();
        assert!(load_config(&path).is_ok());
        assert!(matches!(
            load_config(dir.path().join("missing.json")),
            Err(ConfigError::ReadFile { .. })
        ));
    }
}
