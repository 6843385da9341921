//! Client settings loaded from TOML files
//!
//! Every section is optional; missing values fall back to the backend's
//! stock routes and limits.
//!
//! ```toml
//! [endpoints]
//! chat_message = "/api/multi/chat"
//!
//! [limits]
//! pdf_max_bytes = 209715200
//!
//! [http]
//! connect_timeout_secs = 10
//!
//! [polling]
//! interval_ms = 2000
//! max_attempts = 60
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::PollPolicy;

const MIB: u64 = 1024 * 1024;

/// Root client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub endpoints: Endpoints,

    #[serde(default)]
    pub limits: UploadLimits,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub polling: PollPolicy,
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "polling.max_attempts must be at least 1".into(),
            ));
        }
        if self.polling.backoff < 1.0 {
            return Err(ConfigError::Validation(
                "polling.backoff must be >= 1.0".into(),
            ));
        }
        if self.polling.max_interval_ms < self.polling.interval_ms {
            return Err(ConfigError::Validation(
                "polling.max_interval_ms must not be below polling.interval_ms".into(),
            ));
        }
        if self.limits.pdf_max_bytes == 0 || self.limits.csv_max_bytes == 0 {
            return Err(ConfigError::Validation(
                "upload limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Backend route paths, relative to the base URL
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Endpoints {
    /// Streaming chat reply
    pub chat_message: String,

    /// Session collection (`/create-session`, `/{id}`, `/{id}/messages`)
    pub sessions: String,

    pub pdf_upload: String,
    pub pdf_record: String,

    pub csv_upload: String,
    pub csv_record: String,

    pub web_scrape: String,
    pub web_record: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            chat_message: "/api/multi/chat".to_string(),
            sessions: "/api/chat".to_string(),
            pdf_upload: "/api/pdf/upload-pdf".to_string(),
            pdf_record: "/api/pdf".to_string(),
            csv_upload: "/api/csv/upload-csv".to_string(),
            csv_record: "/api/csv".to_string(),
            web_scrape: "/api/web/scrape".to_string(),
            web_record: "/api/web".to_string(),
        }
    }
}

/// Size caps checked before any upload leaves the machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadLimits {
    pub pdf_max_bytes: u64,
    pub csv_max_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            pdf_max_bytes: 200 * MIB,
            csv_max_bytes: 50 * MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpSettings {
    pub connect_timeout_secs: u64,

    /// Applies to plain JSON requests; streamed replies are not capped
    pub request_timeout_secs: u64,

    /// Page size for session and history listings
    pub list_limit: u32,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
            list_limit: 100,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[endpoints]
chat_message = "/v2/chat/stream"
web_scrape = "/v2/web/scrape-url"

[limits]
csv_max_bytes = 1048576

[http]
connect_timeout_secs = 3

[polling]
interval_ms = 500
max_interval_ms = 4000
backoff = 2.0
max_attempts = 12
"#;

    #[test]
    fn test_parse_config() {
        let config = ClientConfig::from_str(SAMPLE_CONFIG).unwrap();

        assert_eq!(config.endpoints.chat_message, "/v2/chat/stream");
        assert_eq!(config.endpoints.web_scrape, "/v2/web/scrape-url");
        // Untouched routes keep their defaults
        assert_eq!(config.endpoints.sessions, "/api/chat");

        assert_eq!(config.limits.csv_max_bytes, MIB);
        assert_eq!(config.limits.pdf_max_bytes, 200 * MIB);
        assert_eq!(config.http.connect_timeout_secs, 3);
        assert_eq!(config.http.list_limit, 100);

        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.polling.max_attempts, 12);
    }

    #[test]
    fn test_empty_config() {
        let config = ClientConfig::from_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_rejects_invalid_polling() {
        let err = ClientConfig::from_str("[polling]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));

        let err = ClientConfig::from_str("[polling]\nbackoff = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_bad_toml() {
        let err = ClientConfig::from_str("[endpoints\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
