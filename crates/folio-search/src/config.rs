//! Pipeline configuration.
//!
//! [`PipelineConfig`] is plain serde data with a default for every field, so
//! a config file only needs the keys it wants to change.  Files are TOML
//! unless their extension is `.json`.  A handful of `FOLIO_*` environment
//! variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::batcher::BatchTiming;
use crate::error::{Result, SearchError};
use crate::provider::RetryPolicy;
use crate::provider::request::completions_url;
use crate::queue::QueueLimits;

/// Environment variable overriding `provider.base_url`.
pub const ENV_BASE_URL: &str = "FOLIO_API_BASE_URL";
/// Environment variable overriding `cache.path`.
pub const ENV_CACHE_PATH: &str = "FOLIO_CACHE_PATH";
/// Environment variable overriding `provider.cheap_model`.
pub const ENV_CHEAP_MODEL: &str = "FOLIO_CHEAP_MODEL";
/// Environment variable overriding `provider.premium_model`.
pub const ENV_PREMIUM_MODEL: &str = "FOLIO_PREMIUM_MODEL";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Provider endpoint and sampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL; requests go to `{base_url}/chat/completions`.
    pub base_url: String,
    /// Model for simple queries.
    pub cheap_model: String,
    /// Model for complex queries.
    pub premium_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Upper bound on one streaming attempt, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.perplexity.ai".into(),
            cheap_model: "sonar".into(),
            premium_model: "sonar-pro".into(),
            temperature: 0.7,
            max_tokens: 1024,
            request_timeout_secs: 30,
        }
    }
}

/// Reconnection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Retry `n` waits `base_delay_ms * 2^n`.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Fixed-window rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per window.
    pub capacity: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            window_secs: 60,
        }
    }
}

/// Bounds on the deferred-request queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_depth: usize,
    pub max_wait_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_wait_secs: 120,
        }
    }
}

/// Answer cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file backing the cache.
    pub path: PathBuf,
    /// Whether to persist at all.  When `false` the cache is memory-only.
    pub persist: bool,
    pub ttl_secs: u64,
    /// Bound on the in-memory index.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/folio-cache.db"),
            persist: true,
            ttl_secs: 3600,
            max_entries: 1000,
        }
    }
}

/// Token batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub interval_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 50,
            max_latency_ms: 250,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub batcher: BatcherConfig,
}

impl PipelineConfig {
    /// Load from `path`.  A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| SearchError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        info!(path = %path.display(), "configuration loaded from file");
        Ok(config)
    }

    /// Parse TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SearchError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Parse JSON text.
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| SearchError::Config {
            reason: format!("failed to parse JSON config: {e}"),
        })
    }

    /// Apply `FOLIO_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup.  Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = var(ENV_BASE_URL) {
            self.provider.base_url = url;
        }
        if let Some(path) = var(ENV_CACHE_PATH) {
            self.cache.path = PathBuf::from(path);
        }
        if let Some(model) = var(ENV_CHEAP_MODEL) {
            self.provider.cheap_model = model;
        }
        if let Some(model) = var(ENV_PREMIUM_MODEL) {
            self.provider.premium_model = model;
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        completions_url(&self.provider.base_url)?;

        let checks: [(bool, &str); 11] = [
            (!self.provider.cheap_model.trim().is_empty(), "provider.cheap_model must not be empty"),
            (!self.provider.premium_model.trim().is_empty(), "provider.premium_model must not be empty"),
            ((0.0..=2.0).contains(&self.provider.temperature), "provider.temperature must be within [0, 2]"),
            (self.provider.max_tokens > 0, "provider.max_tokens must be positive"),
            (self.provider.request_timeout_secs > 0, "provider.request_timeout_secs must be positive"),
            (self.rate_limit.capacity > 0, "rate_limit.capacity must be positive"),
            (self.rate_limit.window_secs > 0, "rate_limit.window_secs must be positive"),
            (self.queue.max_depth > 0, "queue.max_depth must be positive"),
            (self.cache.max_entries > 0, "cache.max_entries must be positive"),
            (self.batcher.interval_ms > 0, "batcher.interval_ms must be positive"),
            (
                self.batcher.max_latency_ms >= self.batcher.interval_ms,
                "batcher.max_latency_ms must not be below batcher.interval_ms",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(SearchError::Config {
                reason: (*reason).to_owned(),
            }),
            None => Ok(()),
        }
    }

    // -- derived settings ----------------------------------------------------

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            max_depth: self.queue.max_depth,
            max_wait: Duration::from_secs(self.queue.max_wait_secs),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn batch_timing(&self) -> BatchTiming {
        BatchTiming {
            interval: Duration::from_millis(self.batcher.interval_ms),
            max_latency: Duration::from_millis(self.batcher.max_latency_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
