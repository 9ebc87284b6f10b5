//! Configuration for the SDK

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SDK configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project API key issued by the dashboard
    pub api_key: String,

    /// Bundle identifier of the host application
    pub bundle_id: String,

    /// Custom URI scheme registered for deep links (e.g. "myapp")
    pub uri_scheme: Option<String>,

    /// Use the test environment (project key is sent with a `test_` prefix)
    pub use_test_environment: bool,

    /// Backend base URL, without the `/api/v1/sdk` path
    pub base_url: String,

    /// Data directory for the durable collections
    pub data_dir: PathBuf,

    /// Optional user agent forwarded on every request
    pub user_agent: Option<String>,

    /// Network knobs
    pub network: NetworkConfig,

    /// Event pipeline knobs
    pub events: EventConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            bundle_id: String::new(),
            uri_scheme: None,
            use_test_environment: false,
            base_url: "https://sdk.sqd.link".to_string(),
            data_dir: PathBuf::from("./data/grovs"),
            user_agent: None,
            network: NetworkConfig::default(),
            events: EventConfig::default(),
        }
    }
}

/// Network retry/backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Base retry delay (seconds)
    pub base_retry_delay_secs: u64,

    /// Increment added to the delay after each failed attempt (seconds)
    pub retry_delay_increment_secs: u64,

    /// Ceiling on the retry delay (seconds)
    pub max_retry_delay_secs: u64,

    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_secs: 2,        // reset-to value after any success
            retry_delay_increment_secs: 10,  // linear growth, not exponential
            max_retry_delay_secs: 60,
            request_timeout_secs: 30,
        }
    }
}

impl NetworkConfig {
    /// Base retry delay
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.base_retry_delay_secs)
    }

    /// Per-failure delay increment
    pub fn retry_delay_increment(&self) -> Duration {
        Duration::from_secs(self.retry_delay_increment_secs)
    }

    /// Delay ceiling
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

/// Event pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Startup grace window before the first flush (seconds)
    pub startup_grace_secs: u64,

    /// Days of inactivity after which an app open counts as a reactivation
    pub reactivation_threshold_days: i64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            startup_grace_secs: 5,
            reactivation_threshold_days: 7,
        }
    }
}

impl EventConfig {
    /// Startup grace window
    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }
}

impl Config {
    /// Build a config with the two mandatory fields set
    pub fn new(api_key: impl Into<String>, bundle_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            bundle_id: bundle_id.into(),
            ..Self::default()
        }
    }

    /// Load overrides from environment variables
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(key) = std::env::var("GROVS_API_KEY") {
            config.api_key = key;
        }
        if let Ok(bundle) = std::env::var("GROVS_BUNDLE_ID") {
            config.bundle_id = bundle;
        }
        if let Ok(url) = std::env::var("GROVS_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(dir) = std::env::var("GROVS_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config
    }

    /// Project key as sent on the wire (`test_` prefix in the test environment)
    pub fn wire_project_key(&self) -> String {
        if self.use_test_environment {
            format!("test_{}", self.api_key)
        } else {
            self.api_key.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.base_retry_delay_secs, 2);
        assert_eq!(config.network.max_retry_delay_secs, 60);
        assert_eq!(config.events.startup_grace_secs, 5);
        assert!(!config.use_test_environment);
    }

    #[test]
    fn test_wire_project_key_test_env() {
        let mut config = Config::new("abc123", "com.example.app");
        assert_eq!(config.wire_project_key(), "abc123");

        config.use_test_environment = true;
        assert_eq!(config.wire_project_key(), "test_abc123");
    }
}
