//! Watcher configuration.
//!
//! # Example
//!
//! ```rust
//! use blockwatch_core::config::WatchConfigBuilder;
//!
//! let config = WatchConfigBuilder::new()
//!     .chain("sepolia")
//!     .max_depth(64)
//!     .poll_interval_ms(4_000)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.history_depth(), 64);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WatchError;
use crate::retry::{RetryConfig, RetryPolicy};

/// Backoff settings for block source calls, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 { 5 }
fn default_initial_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Configuration for a processor + machine pair watching one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Chain label, used in logs only.
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Blocks retained behind the head; also the deepest recoverable reorg.
    #[serde(default = "default_max_depth")]
    pub max_depth: u64,
    /// Head polling interval for polling sources (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout applied to each block source call (milliseconds).
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Capacity of the processor and machine broadcast channels.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Anchor states kept per component for reorg replay. Defaults to `max_depth`.
    #[serde(default)]
    pub history_depth: Option<u64>,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_chain() -> String { "ethereum".into() }
fn default_max_depth() -> u64 { 50 }
fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_fetch_timeout_ms() -> u64 { 10_000 }
fn default_event_capacity() -> usize { 256 }

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            max_depth: default_max_depth(),
            poll_interval_ms: default_poll_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            event_capacity: default_event_capacity(),
            history_depth: None,
            retry: RetrySettings::default(),
        }
    }
}

impl WatchConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, WatchError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| WatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WatchError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| WatchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        if self.max_depth == 0 {
            return Err(WatchError::Config("max_depth must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(WatchError::Config("poll_interval_ms must be positive".into()));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(WatchError::Config("fetch_timeout_ms must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(WatchError::Config("event_capacity must be positive".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(WatchError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    pub fn history_depth(&self) -> u64 {
        self.history_depth.unwrap_or(self.max_depth)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            multiplier: self.retry.multiplier,
            ..RetryConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_config())
    }
}

/// Fluent builder for [`WatchConfig`].
#[derive(Default)]
pub struct WatchConfigBuilder {
    config: WatchConfig,
}

impl WatchConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    pub fn max_depth(mut self, depth: u64) -> Self {
        self.config.max_depth = depth;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn history_depth(mut self, depth: u64) -> Self {
        self.config.history_depth = Some(depth);
        self
    }

    /// Retry source calls up to `max_retries` times, starting at
    /// `initial_backoff_ms` and doubling.
    pub fn retry(mut self, max_retries: u32, initial_backoff_ms: u64) -> Self {
        self.config.retry.max_retries = max_retries;
        self.config.retry.initial_backoff_ms = initial_backoff_ms;
        self
    }

    pub fn retry_settings(mut self, retry: RetrySettings) -> Self {
        self.config.retry = retry;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<WatchConfig, WatchError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.max_depth, 50);
        assert_eq!(cfg.poll_interval_ms, 1_000);
        assert_eq!(cfg.history_depth(), 50);
        assert_eq!(cfg.retry.max_retries, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields() {
        let cfg = WatchConfig::from_json_str(r#"{ "max_depth": 12, "retry": { "max_retries": 1 } }"#)
            .unwrap();
        assert_eq!(cfg.max_depth, 12);
        assert_eq!(cfg.history_depth(), 12);
        assert_eq!(cfg.chain, "ethereum");
        assert_eq!(cfg.retry.max_retries, 1);
        assert_eq!(cfg.retry.initial_backoff_ms, 200);
    }

    #[test]
    fn rejects_invalid() {
        let err = WatchConfig::from_json_str(r#"{ "max_depth": 0 }"#).unwrap_err();
        assert!(matches!(err, WatchError::Config(_)));
        assert!(WatchConfig::from_json_str("not json").is_err());
        assert!(WatchConfigBuilder::new()
            .retry_settings(RetrySettings {
                multiplier: 0.5,
                ..Default::default()
            })
            .build()
            .is_err());
    }

    #[test]
    fn builder_custom() {
        let cfg = WatchConfigBuilder::new()
            .chain("polygon")
            .max_depth(128)
            .history_depth(16)
            .fetch_timeout_ms(2_500)
            .retry(2, 50)
            .build()
            .unwrap();
        assert_eq!(cfg.chain, "polygon");
        assert_eq!(cfg.history_depth(), 16);
        assert_eq!(cfg.fetch_timeout(), Duration::from_millis(2_500));
        let retry = cfg.retry_config();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.initial_backoff, Duration::from_millis(50));
    }

    #[test]
    fn load_missing_file() {
        let err = WatchConfig::load("/nonexistent/blockwatch.json").unwrap_err();
        assert!(matches!(err, WatchError::Config(msg) if msg.contains("blockwatch.json")));
    }
}
