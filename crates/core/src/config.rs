use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{PulseError, PulseResult};

/// Connect timeout for a single delivery attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Read timeout for a single delivery attempt.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Root SDK configuration. Loaded from environment variables with the
/// prefix `PULSE__`, or built in code with [`PulseConfig::new`].
#[derive(Debug, Clone, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub app_key: String,
    /// Developer-supplied device id. When absent the SDK resolves one.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_event_flush_threshold")]
    pub event_flush_threshold: usize,
    #[serde(default = "default_token_session_delay_secs")]
    pub token_session_delay_secs: u64,
    #[serde(default)]
    pub disable_update_session_requests: bool,
    #[serde(default)]
    pub auto_view_tracking: bool,
    /// Base64-encoded DER certificates the collector must present.
    #[serde(default)]
    pub pinned_public_keys: Vec<String>,
    #[serde(default = "default_view_segment")]
    pub view_segment: String,
    #[serde(default)]
    pub store_path: Option<String>,
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}
fn default_event_flush_threshold() -> usize {
    10
}
fn default_token_session_delay_secs() -> u64 {
    10
}
fn default_view_segment() -> String {
    "Rust".to_string()
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            app_key: String::new(),
            device_id: None,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            event_flush_threshold: default_event_flush_threshold(),
            token_session_delay_secs: default_token_session_delay_secs(),
            disable_update_session_requests: false,
            auto_view_tracking: false,
            pinned_public_keys: Vec::new(),
            view_segment: default_view_segment(),
            store_path: None,
        }
    }
}

impl PulseConfig {
    pub fn new(server_url: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            app_key: app_key.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables (`PULSE__APP_KEY`, ...).
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("pinned_public_keys"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn token_session_delay(&self) -> Duration {
        Duration::from_secs(self.token_session_delay_secs)
    }

    /// Checks everything the SDK needs before it can accept a single call.
    pub fn validate(&self) -> PulseResult<()> {
        let url = url::Url::parse(&self.server_url)
            .map_err(|e| PulseError::config(format!("server URL is not valid: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(PulseError::config(format!(
                "server URL must use http or https, got {}",
                url.scheme()
            )));
        }
        if self.app_key.is_empty() {
            return Err(PulseError::config("app key has not been set"));
        }
        if matches!(self.device_id.as_deref(), Some("")) {
            return Err(PulseError::config("developer-supplied device id is empty"));
        }
        if self.event_flush_threshold == 0 {
            return Err(PulseError::config("event flush threshold must be positive"));
        }
        if !self.pinned_public_keys.is_empty() {
            if url.scheme() != "https" {
                return Err(PulseError::config(
                    "server URL must use https once public keys are pinned",
                ));
            }
            for (index, key) in self.pinned_public_keys.iter().enumerate() {
                base64::engine::general_purpose::STANDARD
                    .decode(key.trim())
                    .map_err(|e| {
                        PulseError::config(format!("pinned public key #{index} is not base64: {e}"))
                    })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PulseConfig::new("https://collector.example.com", "K");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.event_flush_threshold, 10);
        assert_eq!(config.token_session_delay(), Duration::from_secs(10));
        assert!(!config.disable_update_session_requests);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_server_url() {
        let config = PulseConfig::new("not a url", "K");
        assert!(matches!(config.validate(), Err(PulseError::Config(_))));

        let config = PulseConfig::new("ftp://collector.example.com", "K");
        assert!(matches!(config.validate(), Err(PulseError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_app_key() {
        let config = PulseConfig::new("https://collector.example.com", "");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("app key"));
    }

    #[test]
    fn test_pinning_requires_https() {
        let mut config = PulseConfig::new("http://collector.example.com", "K");
        config.pinned_public_keys = vec!["TUlJQg==".into()];
        assert!(matches!(config.validate(), Err(PulseError::Config(_))));

        config.server_url = "https://collector.example.com".into();
        assert!(config.validate().is_ok());

        config.pinned_public_keys = vec!["***".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_developer_id() {
        let mut config = PulseConfig::new("https://collector.example.com", "K");
        config.device_id = Some(String::new());
        assert!(config.validate().is_err());
    }
}
