use std::path::Path;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Load configuration from an optional TOML file
///
/// Without a path the built-in defaults are returned. Sections or keys
/// missing from the file keep their default values.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };

    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config: AppConfig = toml::from_str(&raw)?;

    tracing::debug!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_without_path_uses_defaults() {
        let config = load_config(None).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [web]
            port = 8080
            cors_allowed_origins = ["https://viewer.example.com"]

            [relay]
            heartbeat_interval_secs = 10
            missed_heartbeats = 2
            "#
        )
        .unwrap();

        let config = load_config(Some(file.path())).await.unwrap();
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.web.bind_address, "0.0.0.0");
        assert_eq!(config.web.cors_allowed_origins.len(), 1);
        assert_eq!(config.relay.heartbeat_interval_secs, 10);
        assert_eq!(config.relay.missed_heartbeats, 2);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("missing.toml"))).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay\nheartbeat_interval_secs = ").unwrap();

        let result = load_config(Some(file.path())).await;
        assert!(matches!(result, Err(AppError::ConfigParse(_))));
    }
}
