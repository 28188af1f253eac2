//! Relay configuration with JSON file loading and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelayConfig::default()`]
//! 2. If a JSON file is given, its fields override the defaults
//! 3. `RELAY_*` environment variables override both
//!
//! Invalid environment values are ignored and logged.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub session: SessionSettings,
    pub delivery: DeliverySettings,
}

/// Orchestrator, cache and lifecycle bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// How long `connect_session` waits for a pairing code.
    pub qr_timeout_ms: u64,
    /// Default cache entry TTL.
    pub cache_ttl_ms: u64,
    /// Interval of the cache eviction sweep.
    pub cache_sweep_interval_ms: u64,
    /// Capacity of the lifecycle event channel.
    pub lifecycle_capacity: usize,
    /// Interval of the lifecycle activity sweep.
    pub activity_sweep_interval_ms: u64,
    /// Per-session activity older than this is forgotten.
    pub inactivity_threshold_ms: u64,
    /// Capacity of the channel feeding the webhook pipeline.
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            qr_timeout_ms: 60_000,
            cache_ttl_ms: 60 * 60 * 1000,
            cache_sweep_interval_ms: 15 * 60 * 1000,
            lifecycle_capacity: 1000,
            activity_sweep_interval_ms: 5 * 60 * 1000,
            inactivity_threshold_ms: 60 * 60 * 1000,
            event_buffer: 10_000,
        }
    }
}

impl SessionSettings {
    #[must_use]
    pub const fn qr_timeout(&self) -> Duration {
        Duration::from_millis(self.qr_timeout_ms)
    }

    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    #[must_use]
    pub const fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    #[must_use]
    pub const fn activity_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.activity_sweep_interval_ms)
    }

    #[must_use]
    pub const fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }
}

/// Webhook delivery pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Number of delivery workers.
    pub workers: usize,
    /// Capacity of the main delivery queue.
    pub queue_capacity: usize,
    /// Capacity of the retry hand-off channel.
    pub retry_capacity: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter band as a fraction of the delay (0.25 = ±25%).
    pub jitter_factor: f64,
    /// Retry coordinator tick.
    pub retry_tick_ms: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            workers: 5,
            queue_capacity: 1000,
            retry_capacity: 1000,
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            jitter_factor: 0.25,
            retry_tick_ms: 1000,
            request_timeout_ms: 30_000,
        }
    }
}

impl DeliverySettings {
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub const fn retry_tick(&self) -> Duration {
        Duration::from_millis(self.retry_tick_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl RelayConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file (defaults if it does not exist), then apply
    /// environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            debug!(?path, "loading relay config from file");
            Self::from_json_str(&std::fs::read_to_string(path)?)?
        } else {
            debug!(?path, "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `RELAY_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read_u64 = |key: &str, min: u64, max: u64| parse_ranged(key, lookup(key), min, max);

        if let Some(v) = read_u64("RELAY_QR_TIMEOUT_MS", 1, 600_000) {
            self.session.qr_timeout_ms = v;
        }
        if let Some(v) = read_u64("RELAY_CACHE_TTL_MS", 1, u64::MAX) {
            self.session.cache_ttl_ms = v;
        }
        if let Some(v) = read_u64("RELAY_EVENT_BUFFER", 1, 1_000_000) {
            self.session.event_buffer = usize::try_from(v).unwrap_or(self.session.event_buffer);
        }
        if let Some(v) = read_u64("RELAY_WEBHOOK_WORKERS", 1, 256) {
            self.delivery.workers = usize::try_from(v).unwrap_or(self.delivery.workers);
        }
        if let Some(v) = read_u64("RELAY_WEBHOOK_QUEUE", 1, 1_000_000) {
            self.delivery.queue_capacity = usize::try_from(v).unwrap_or(self.delivery.queue_capacity);
        }
        if let Some(v) = read_u64("RELAY_WEBHOOK_MAX_RETRIES", 0, 100) {
            self.delivery.max_retries = u32::try_from(v).unwrap_or(self.delivery.max_retries);
        }
        if let Some(v) = read_u64("RELAY_WEBHOOK_BASE_DELAY_MS", 1, 3_600_000) {
            self.delivery.base_delay_ms = v;
        }
        if let Some(v) = read_u64("RELAY_WEBHOOK_MAX_DELAY_MS", 1, 86_400_000) {
            self.delivery.max_delay_ms = v;
        }
        if let Some(v) = read_u64("RELAY_WEBHOOK_TIMEOUT_MS", 1, 600_000) {
            self.delivery.request_timeout_ms = v;
        }
    }
}

fn parse_ranged(key: &str, raw: Option<String>, min: u64, max: u64) -> Option<u64> {
    let raw = raw?;
    match raw.trim().parse::<u64>() {
        Ok(v) if (min..=max).contains(&v) => Some(v),
        _ => {
            warn!(key, value = %raw, "ignoring invalid environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.session.qr_timeout(), Duration::from_secs(60));
        assert_eq!(config.session.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.session.cache_sweep_interval(), Duration::from_secs(900));
        assert_eq!(config.session.lifecycle_capacity, 1000);
        assert_eq!(config.delivery.workers, 5);
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.delivery.retry_tick(), Duration::from_secs(1));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RelayConfig::from_json_str(
            r#"{ "session": { "qrTimeoutMs": 5000 }, "delivery": { "workers": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.session.qr_timeout_ms, 5000);
        assert_eq!(config.session.event_buffer, 10_000);
        assert_eq!(config.delivery.workers, 2);
        assert_eq!(config.delivery.queue_capacity, 1000);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            RelayConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_apply_and_invalid_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RELAY_QR_TIMEOUT_MS", "1500"),
            ("RELAY_WEBHOOK_WORKERS", "0"),
            ("RELAY_WEBHOOK_MAX_RETRIES", "not-a-number"),
            ("RELAY_WEBHOOK_QUEUE", "50"),
        ]);
        let mut config = RelayConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.session.qr_timeout_ms, 1500);
        assert_eq!(config.delivery.workers, 5);
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.delivery.queue_capacity, 50);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = RelayConfig::load(Path::new("/definitely/not/here.json")).unwrap();
        assert_eq!(config.delivery, DeliverySettings::default());
    }
}
