// Guard Configuration
// Token endpoint, alert lifetime, input bounds and transport limits

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::http_client::{DEFAULT_TIMEOUT, MAX_RESPONSE_SIZE};
use crate::security::alerts::DEFAULT_ALERT_TTL_MS;
use crate::security::gate::CSRF_HEADER;
use crate::security::token::DEFAULT_TOKEN_PATH;
use crate::security::validation::MAX_INPUT_LENGTH;

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "DINOGUARD_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Origin of the application backend; relative request paths resolve against it
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_token_path")]
    pub token_path: String,

    /// Header carrying the CSRF token on outgoing requests
    #[serde(default = "default_csrf_header")]
    pub csrf_header: String,

    /// How long an alert stays listed (default: 10 seconds)
    #[serde(default = "default_alert_ttl_ms")]
    pub alert_ttl_ms: u64,

    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,

    /// Refresh the token in the background this close to expiry (0 disables)
    #[serde(default)]
    pub refresh_margin_secs: u64,

    #[serde(default = "default_true")]
    pub prefetch_on_start: bool,

    /// JSON file mirroring the token; in-memory when absent
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub cookies_enabled: bool,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_token_path() -> String {
    DEFAULT_TOKEN_PATH.to_string()
}

fn default_csrf_header() -> String {
    CSRF_HEADER.to_string()
}

fn default_alert_ttl_ms() -> u64 {
    DEFAULT_ALERT_TTL_MS
}

fn default_max_input_length() -> usize {
    MAX_INPUT_LENGTH
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_max_response_size() -> usize {
    MAX_RESPONSE_SIZE
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token_path: default_token_path(),
            csrf_header: default_csrf_header(),
            alert_ttl_ms: default_alert_ttl_ms(),
            max_input_length: default_max_input_length(),
            refresh_margin_secs: 0,
            prefetch_on_start: true,
            storage_path: None,
            cookies_enabled: true,
            request_timeout_ms: default_request_timeout_ms(),
            max_response_size: default_max_response_size(),
        }
    }
}

impl GuardConfig {
    /// Defaults, then the optional TOML file, then `DINOGUARD_*` variables
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(GuardConfig::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Parse a TOML document on top of the defaults, ignoring the environment
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(GuardConfig::default())).merge(Toml::string(toml)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: GuardConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::invalid("base_url", "must use http or https"));
        }

        if self.token_path.trim().is_empty() {
            return Err(ConfigError::invalid("token_path", "must not be empty"));
        }

        if self.csrf_header.trim().is_empty() {
            return Err(ConfigError::invalid("csrf_header", "must not be empty"));
        }
        if HeaderName::from_bytes(self.csrf_header.as_bytes()).is_err() {
            return Err(ConfigError::invalid(
                "csrf_header",
                "is not a valid HTTP header name",
            ));
        }

        if self.alert_ttl_ms == 0 {
            return Err(ConfigError::invalid("alert_ttl_ms", "must be at least 1"));
        }

        if self.max_input_length == 0 {
            return Err(ConfigError::invalid("max_input_length", "must be at least 1"));
        }

        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|e| ConfigError::invalid("base_url", e.to_string()))
    }

    pub fn alert_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.alert_ttl_ms.min(i64::MAX as u64) as i64)
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.refresh_margin_secs.min(i64::MAX as u64) as i64)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.token_path, "/api/csrf-token");
        assert_eq!(config.csrf_header, "X-CSRF-Token");
        assert_eq!(config.alert_ttl_ms, 10_000);
        assert_eq!(config.max_input_length, 1000);
        assert_eq!(config.refresh_margin(), chrono::Duration::zero());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = GuardConfig::from_toml_str(
            r#"
            base_url = "https://app.example.com"
            alert_ttl_ms = 5000
            refresh_margin_secs = 30
            prefetch_on_start = false
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://app.example.com");
        assert_eq!(config.alert_ttl(), chrono::Duration::milliseconds(5000));
        assert_eq!(config.refresh_margin(), chrono::Duration::seconds(30));
        assert!(!config.prefetch_on_start);
        assert_eq!(config.token_path, DEFAULT_TOKEN_PATH);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            ("base_url = \"not a url\"", "base_url"),
            ("base_url = \"ftp://example.com\"", "base_url"),
            ("token_path = \"  \"", "token_path"),
            ("csrf_header = \"bad header\"", "csrf_header"),
            ("alert_ttl_ms = 0", "alert_ttl_ms"),
            ("max_input_length = 0", "max_input_length"),
        ];

        for (toml, expected_key) in cases {
            match GuardConfig::from_toml_str(toml) {
                Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, expected_key),
                other => panic!("{toml}: expected invalid {expected_key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("guard.toml", "alert_ttl_ms = 2000\nmax_input_length = 50")?;
            jail.set_env("DINOGUARD_ALERT_TTL_MS", "3000");

            let config = GuardConfig::load(Some(Path::new("guard.toml"))).unwrap();
            assert_eq!(config.alert_ttl_ms, 3000);
            assert_eq!(config.max_input_length, 50);
            Ok(())
        });
    }
}
