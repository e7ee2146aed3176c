//! WebHooks Sender Configuration
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dispatcher: DispatcherSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub sweeper: SweeperSettings,
    pub store: StoreSettings,
}

/// Worker pool and HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Maximum concurrent sends
    pub concurrency: usize,
    /// Per-attempt timeout in milliseconds
    pub request_timeout_ms: u64,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound on the shutdown drain
    pub shutdown_timeout_secs: u64,
    /// Header carrying the `sha256=<hex>` body signature
    pub signature_header: String,
    pub user_agent: String,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            shutdown_timeout_secs: 30,
            signature_header: "ms-signature".to_string(),
            user_agent: concat!("wh-sender/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Backoff shape between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `base_delay_ms * retry`
    Linear,
    /// One delay per retry taken from `delays_ms`
    Fixed,
    /// `base_delay_ms * 2^(retry-1)`, capped at `max_delay_ms`
    Exponential,
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub delays_ms: Vec<u64>,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffKind::Linear,
            base_delay_ms: 1_000,
            delays_ms: vec![60_000, 240_000],
            max_delay_ms: 300_000,
        }
    }
}

/// Per-destination circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// How long a tripped circuit rejects attempts
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Policy sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Policies unused for longer than this are dropped
    pub idle_window_secs: u64,
    /// Destinations without a success for longer than this are disabled
    pub failure_window_secs: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 600,
            idle_window_secs: 86_400,
            failure_window_secs: 86_400,
        }
    }
}

/// Registration store settings (used by the sender binary)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub registrations_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            registrations_path: "./data/registrations.json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.concurrency must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "dispatcher.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.dispatcher.signature_header.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "dispatcher.signature_header cannot be empty".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff == BackoffKind::Fixed && self.retry.delays_ms.is_empty() {
            return Err(ConfigError::ValidationError(
                "retry.delays_ms cannot be empty with fixed backoff".to_string(),
            ));
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "sweeper.interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# WebHooks Sender Configuration
# Environment variables (WEBHOOKS_*) override these settings

[dispatcher]
concurrency = 8
request_timeout_ms = 10000
connect_timeout_ms = 5000
shutdown_timeout_secs = 30
signature_header = "ms-signature"

[retry]
max_retries = 3
backoff = "linear"  # linear, fixed, or exponential
base_delay_ms = 1000
delays_ms = [60000, 240000]
max_delay_ms = 300000

[circuit_breaker]
failure_threshold = 5
cooldown_secs = 30

[sweeper]
enabled = true
interval_secs = 600
idle_window_secs = 86400
failure_window_secs = 86400

[store]
registrations_path = "./data/registrations.json"
"#
        .to_string()
    }
}
