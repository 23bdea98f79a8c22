//! Sharded registry of per-client usage records.

use std::time::{Duration, Instant};

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::key::ClientKey;
use super::window::{Algorithm, UsageRecord};

/// Thread-safe mapping from client key to usage record.
///
/// Keys are hashed into independently locked shards, so requests for
/// unrelated clients only contend when they land in the same shard, and then
/// only for the duration of a single window update.
pub struct KeyRegistry {
    records: DashMap<ClientKey, UsageRecord>,
    shard_count: usize,
    algorithm: Algorithm,
    window: Duration,
    retention: Duration,
}

impl KeyRegistry {
    /// Create an empty registry.
    ///
    /// `shard_count` is rounded up to a power of two (at least 2).
    pub fn new(
        shard_count: usize,
        algorithm: Algorithm,
        window: Duration,
        retention: Duration,
    ) -> Self {
        let shard_count = shard_count.max(2).next_power_of_two();
        Self {
            records: DashMap::with_shard_amount(shard_count),
            shard_count,
            algorithm,
            window,
            retention,
        }
    }

    /// Return the record for `key`, inserting a fresh one if absent.
    ///
    /// A record found idle past the retention period is replaced rather than
    /// reused. The returned guard holds the key's shard lock: drop it before
    /// touching the registry again from the same thread.
    pub fn get_or_create(
        &self,
        key: &ClientKey,
        now: Instant,
    ) -> RefMut<'_, ClientKey, UsageRecord> {
        let mut record = match self.records.get_mut(key) {
            Some(record) => record,
            None => self.records.entry(key.clone()).or_insert_with(|| {
                trace!(key = %key, "Creating usage record");
                UsageRecord::new(self.algorithm, now)
            }),
        };

        if record.is_idle(now, self.window, self.retention) {
            debug!(key = %key, "Recycling idle usage record");
            *record = UsageRecord::new(self.algorithm, now);
        }
        record
    }

    /// Current usage for `key` without creating or updating its record.
    pub fn usage(&self, key: &ClientKey, now: Instant) -> Option<u32> {
        self.records
            .get(key)
            .map(|record| record.usage(self.window, now))
    }

    /// Remove every record that is idle at `now`. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let idle = record.is_idle(now, self.window, self.retention);
            if idle {
                removed += 1;
            }
            !idle
        });
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Effective number of shards.
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.records.clear();
    }
}
