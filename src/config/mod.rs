//! Application configuration

pub mod client;

use std::path::Path;

pub use client::{ClientConfig, ConfigError, Endpoints, UploadLimits};

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the analysis backend
    pub backend_url: String,
    /// Identity forwarded to the backend on every request
    pub user_id: String,
    pub client: ClientConfig,
}

impl Config {
    /// Resolve settings gathered from flags and environment, reading the
    /// optional TOML file for everything else
    pub fn load(
        backend_url: impl Into<String>,
        user_id: impl Into<String>,
        client_config: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(ConfigError::Validation("user id must not be empty".into()));
        }

        let client = match client_config {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading client config");
                ClientConfig::from_file(path)?
            }
            None => ClientConfig::default(),
        };

        Ok(Self {
            backend_url: backend_url.into(),
            user_id,
            client,
        })
    }

    /// Configuration pointing at an explicit backend, with default settings
    pub fn new(backend_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            user_id: user_id.into(),
            client: ClientConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_without_file() {
        let config = Config::load("http://localhost:8000", "user_2abc", None).unwrap();
        assert_eq!(config.user_id, "user_2abc");
        assert_eq!(config.client.endpoints.sessions, "/api/chat");
    }

    #[test]
    fn test_load_rejects_blank_user() {
        assert!(matches!(
            Config::load("http://localhost:8000", "  ", None),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_load_reads_file() {
        let path = std::env::temp_dir().join(format!("nova-chat-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[polling]\nmax_attempts = 5\n").unwrap();

        let config = Config::load("http://x", "u", Some(&path)).unwrap();
        assert_eq!(config.client.polling.max_attempts, 5);

        std::fs::remove_file(&path).unwrap();
        assert!(Config::load("http://x", "u", Some(&path)).is_err());
    }
}
