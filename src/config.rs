//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::Algorithm;

/// Prefix for environment variable overrides, e.g. `TURNSTILE_RATE_LIMITING__LIMIT`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Key clients by the first `X-Forwarded-For` entry instead of the peer
    /// address. Only enable behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Maximum admitted requests per window for a single client
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Number of independently locked registry partitions
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Idle records are evicted after `window * retention_factor`
    #[serde(default = "default_retention_factor")]
    pub retention_factor: f64,

    /// Interval between background sweeps in milliseconds; 0 disables the
    /// sweep and leaves only eviction on access
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Window accounting algorithm
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            shard_count: default_shard_count(),
            retention_factor: default_retention_factor(),
            reaper_interval_ms: default_reaper_interval_ms(),
            algorithm: Algorithm::default(),
        }
    }
}

fn default_limit() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_shard_count() -> usize {
    16
}

fn default_retention_factor() -> f64 {
    1.0
}

fn default_reaper_interval_ms() -> u64 {
    60_000
}

impl RateLimitingConfig {
    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Background sweep interval, `None` when the sweep is disabled.
    pub fn reaper_interval(&self) -> Option<Duration> {
        (self.reaper_interval_ms > 0).then(|| Duration::from_millis(self.reaper_interval_ms))
    }

    /// How long an idle record is kept, `window * retention_factor`.
    pub fn retention(&self) -> Result<Duration> {
        let secs = self.window().as_secs_f64() * self.retention_factor;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            TurnstileError::Config(format!(
                "retention_factor {} overflows the retention period: {}",
                self.retention_factor, e
            ))
        })
    }

    /// Reject values that would make the limiter admit or deny everything.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TurnstileError::Config(
                "limit must be a positive integer".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::Config(
                "window_ms must be a positive duration".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(TurnstileError::Config(
                "shard_count must be a positive integer".to_string(),
            ));
        }
        if !self.retention_factor.is_finite() || self.retention_factor < 1.0 {
            return Err(TurnstileError::Config(format!(
                "retention_factor must be a finite number >= 1, got {}",
                self.retention_factor
            )));
        }
        self.retention()?;
        Ok(())
    }
}

impl TurnstileConfig {
    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, then apply `TURNSTILE_*`
    /// environment overrides (`__` separates nested keys).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
