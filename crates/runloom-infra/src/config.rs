//! Worker configuration loader for Runloom.
//!
//! Reads `config.toml` from the data directory and deserializes it into
//! [`WorkerConfig`]. Falls back to defaults when the file is missing or
//! malformed; a worker always starts.

use std::path::Path;

use runloom_types::config::WorkerConfig;

/// Load worker configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`WorkerConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and
///   returns the default.
pub async fn load_worker_config(data_dir: &Path) -> WorkerConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return WorkerConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return WorkerConfig::default();
        }
    };

    match toml::from_str::<WorkerConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            WorkerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_worker_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_worker_config(tmp.path()).await;
        assert!(config.secret_key.is_none());
        assert_eq!(config.queue.attempts, 3);
    }

    #[tokio::test]
    async fn load_worker_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
secret_key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"

[http]
timeout_ms = 10000

[output]
max_bytes = 131072
"#,
        )
        .await
        .unwrap();

        let config = load_worker_config(tmp.path()).await;
        assert_eq!(config.http.timeout_ms, 10_000);
        assert_eq!(config.output.max_bytes, 131_072);
        // Untouched sections keep their defaults.
        assert_eq!(config.output.error_max_bytes, 65_536);
        assert_eq!(config.secret_key.unwrap().expose_secret().len(), 64);
    }

    #[tokio::test]
    async fn load_worker_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_worker_config(tmp.path()).await;
        assert_eq!(config.http.timeout_ms, 30_000);
    }
}
