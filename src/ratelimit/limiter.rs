//! Core rate limiter implementation.

use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::key::ClientKey;
use super::registry::KeyRegistry;
use super::window::{Algorithm, Verdict};
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// The limit applied to every client key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitPolicy {
    /// Maximum admitted requests per window
    pub limit: u32,
    /// Length of the trailing window
    pub window: Duration,
    /// How long an idle record is kept
    pub retention: Duration,
    /// Window accounting algorithm
    pub algorithm: Algorithm,
}

/// The core rate limiter.
///
/// This struct is thread-safe and can be shared across threads and tasks
/// behind an `Arc`. Every call to [`allow`](Self::allow) is a bounded,
/// in-memory decision: no I/O, no sleeping.
pub struct RateLimiter {
    policy: LimitPolicy,
    registry: KeyRegistry,
}

impl RateLimiter {
    /// Create a rate limiter from configuration, rejecting invalid values.
    pub fn new(config: &RateLimitingConfig) -> Result<Self> {
        config.validate()?;

        let window = config.window();
        let policy = LimitPolicy {
            limit: config.limit,
            window,
            retention: config.retention()?,
            algorithm: config.algorithm,
        };
        let registry = KeyRegistry::new(
            config.shard_count,
            policy.algorithm,
            window,
            policy.retention,
        );

        debug!(
            limit = policy.limit,
            window_ms = window.as_millis() as u64,
            shards = registry.shard_count(),
            algorithm = ?policy.algorithm,
            "Rate limiter configured"
        );

        Ok(Self { policy, registry })
    }

    /// Decide whether a request from `key` arriving at `now` is admitted,
    /// accounting for it if so.
    pub fn allow(&self, key: &ClientKey, now: Instant) -> Verdict {
        let verdict = {
            let mut record = self.registry.get_or_create(key, now);
            record.check(self.policy.limit, self.policy.window, now)
        };

        trace!(
            key = %key,
            admitted = verdict.admitted,
            remaining = verdict.remaining,
            "Checked rate limit"
        );
        if !verdict.admitted {
            debug!(
                key = %key,
                limit = self.policy.limit,
                retry_after_ms = verdict.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        verdict
    }

    /// Remove records idle at `now`. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        self.registry.sweep(now)
    }

    /// Load currently charged against `key`, or `None` if the key is untracked.
    pub fn usage(&self, key: &ClientKey, now: Instant) -> Option<u32> {
        self.registry.usage(key, now)
    }

    /// Number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.registry.len()
    }

    /// The policy applied to every key.
    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Clear all records.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.registry.clear();
    }
}
