//! Configuration loader with file and environment variable support

use crate::{AppConfig, BackoffKind, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "webhooks.toml",
    "config.toml",
    "./config/webhooks.toml",
    "/etc/webhooks/webhooks.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with_env(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) but with an injectable environment lookup
    pub fn load_with_env<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup) {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_env_overrides(&mut config, &lookup);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured config file does not exist, searching defaults");
        }

        if let Some(path) = lookup("WEBHOOKS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(val) = lookup(key) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %val, "Ignoring unparseable environment override"),
        }
    }
}

fn apply_env_overrides<F>(config: &mut AppConfig, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    // Dispatcher
    parse_into(lookup, "WEBHOOKS_CONCURRENCY", &mut config.dispatcher.concurrency);
    parse_into(lookup, "WEBHOOKS_REQUEST_TIMEOUT_MS", &mut config.dispatcher.request_timeout_ms);
    parse_into(lookup, "WEBHOOKS_CONNECT_TIMEOUT_MS", &mut config.dispatcher.connect_timeout_ms);
    parse_into(lookup, "WEBHOOKS_SHUTDOWN_TIMEOUT_SECS", &mut config.dispatcher.shutdown_timeout_secs);
    if let Some(val) = lookup("WEBHOOKS_SIGNATURE_HEADER") {
        config.dispatcher.signature_header = val;
    }

    // Retry
    parse_into(lookup, "WEBHOOKS_MAX_RETRIES", &mut config.retry.max_retries);
    parse_into(lookup, "WEBHOOKS_BASE_DELAY_MS", &mut config.retry.base_delay_ms);
    parse_into(lookup, "WEBHOOKS_MAX_DELAY_MS", &mut config.retry.max_delay_ms);
    if let Some(val) = lookup("WEBHOOKS_BACKOFF") {
        match val.to_ascii_lowercase().as_str() {
            "linear" => config.retry.backoff = BackoffKind::Linear,
            "fixed" => config.retry.backoff = BackoffKind::Fixed,
            "exponential" => config.retry.backoff = BackoffKind::Exponential,
            other => warn!(value = other, "Unknown WEBHOOKS_BACKOFF, keeping configured value"),
        }
    }
    if let Some(val) = lookup("WEBHOOKS_RETRY_DELAYS_MS") {
        let delays: Result<Vec<u64>, _> = val.split(',').map(|s| s.trim().parse()).collect();
        match delays {
            Ok(delays) => config.retry.delays_ms = delays,
            Err(_) => warn!(value = %val, "Ignoring unparseable WEBHOOKS_RETRY_DELAYS_MS"),
        }
    }

    // Circuit breaker
    parse_into(lookup, "WEBHOOKS_CIRCUIT_FAILURE_THRESHOLD", &mut config.circuit_breaker.failure_threshold);
    parse_into(lookup, "WEBHOOKS_CIRCUIT_COOLDOWN_SECS", &mut config.circuit_breaker.cooldown_secs);

    // Sweeper
    parse_into(lookup, "WEBHOOKS_SWEEPER_ENABLED", &mut config.sweeper.enabled);
    parse_into(lookup, "WEBHOOKS_SWEEPER_INTERVAL_SECS", &mut config.sweeper.interval_secs);
    parse_into(lookup, "WEBHOOKS_SWEEPER_IDLE_WINDOW_SECS", &mut config.sweeper.idle_window_secs);
    parse_into(lookup, "WEBHOOKS_SWEEPER_FAILURE_WINDOW_SECS", &mut config.sweeper.failure_window_secs);

    // Store
    if let Some(val) = lookup("WEBHOOKS_REGISTRATIONS_PATH") {
        config.store.registrations_path = val;
    }
}
