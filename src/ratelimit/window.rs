//! Sliding window accounting for a single client.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Window accounting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Exact: keeps the timestamp of every admitted request in the trailing
    /// window. Memory is bounded by the limit.
    #[default]
    SlidingLog,
    /// Approximate: weights the previous fixed window's count by how much of
    /// it still overlaps the trailing window. Constant memory.
    SlidingCounter,
}

/// The outcome of a single rate limit check.
///
/// `admitted == false` is an expected result, not an error: the caller should
/// reject the triggering request and may surface `retry_after` as a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request was admitted
    pub admitted: bool,
    /// Requests still admissible in the current window
    pub remaining: u32,
    /// Time until at least one slot frees; zero when admitted
    pub retry_after: Duration,
    /// The configured limit
    pub limit: u32,
}

impl Verdict {
    fn admit(limit: u32, remaining: u32) -> Self {
        Self {
            admitted: true,
            remaining,
            retry_after: Duration::ZERO,
            limit,
        }
    }

    fn deny(limit: u32, retry_after: Duration) -> Self {
        Self {
            admitted: false,
            remaining: 0,
            retry_after,
            limit,
        }
    }
}

#[derive(Debug)]
enum WindowState {
    Log {
        hits: VecDeque<Instant>,
    },
    Counter {
        window_start: Instant,
        current: u32,
        previous: u32,
    },
}

/// Usage state of a single client key.
#[derive(Debug)]
pub struct UsageRecord {
    state: WindowState,
    last_seen: Instant,
}

impl UsageRecord {
    /// Create an empty record for a key first seen at `now`.
    pub fn new(algorithm: Algorithm, now: Instant) -> Self {
        let state = match algorithm {
            Algorithm::SlidingLog => WindowState::Log {
                hits: VecDeque::new(),
            },
            Algorithm::SlidingCounter => WindowState::Counter {
                window_start: now,
                current: 0,
                previous: 0,
            },
        };
        Self {
            state,
            last_seen: now,
        }
    }

    /// Account one request at `now` and decide whether it is admitted.
    ///
    /// The decision and the update happen under the same `&mut` borrow, so a
    /// caller holding the key's guard can never observe a half-applied state.
    pub fn check(&mut self, limit: u32, window: Duration, now: Instant) -> Verdict {
        self.last_seen = self.last_seen.max(now);

        let verdict = match &mut self.state {
            WindowState::Log { hits } => check_log(hits, limit, window, now),
            WindowState::Counter {
                window_start,
                current,
                previous,
            } => check_counter(window_start, current, previous, limit, window, now),
        };

        debug_assert!(
            self.count() <= limit,
            "accounted {} requests against a limit of {}",
            self.count(),
            limit
        );
        debug_assert!(verdict.admitted || verdict.remaining == 0);
        verdict
    }

    /// Sliding-log record with a preset hit log, bypassing admission.
    #[cfg(test)]
    fn with_hits(hits: Vec<Instant>, now: Instant) -> Self {
        Self {
            state: WindowState::Log { hits: hits.into() },
            last_seen: now,
        }
    }

    /// Requests accounted in the active window (admitted requests only).
    pub fn count(&self) -> u32 {
        match &self.state {
            WindowState::Log { hits } => hits.len() as u32,
            WindowState::Counter { current, .. } => *current,
        }
    }

    /// Load that would be charged against the limit at `now`, without
    /// recording anything.
    pub fn usage(&self, window: Duration, now: Instant) -> u32 {
        match &self.state {
            WindowState::Log { hits } => hits
                .iter()
                .filter(|&&hit| now.saturating_duration_since(hit) < window)
                .count() as u32,
            WindowState::Counter {
                window_start,
                current,
                previous,
            } => {
                let (start, current, previous) =
                    roll_counter(*window_start, *current, *previous, window, now);
                estimate(start, current, previous, window, now).ceil() as u32
            }
        }
    }

    /// Timestamp of the most recent request.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Whether this record can be dropped without losing anything that still
    /// counts toward a window: untouched for at least `retention` and every
    /// accounted request has aged out.
    pub fn is_idle(&self, now: Instant, window: Duration, retention: Duration) -> bool {
        if now.saturating_duration_since(self.last_seen) < retention {
            return false;
        }
        match &self.state {
            WindowState::Log { hits } => hits
                .back()
                .map_or(true, |&last| now.saturating_duration_since(last) >= window),
            WindowState::Counter { window_start, .. } => {
                now.saturating_duration_since(*window_start) >= window.saturating_mul(2)
            }
        }
    }
}

fn check_log(
    hits: &mut VecDeque<Instant>,
    limit: u32,
    window: Duration,
    now: Instant,
) -> Verdict {
    while let Some(&oldest) = hits.front() {
        if now.saturating_duration_since(oldest) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }

    let count = hits.len() as u32;
    if count < limit {
        // Keep the log sorted even if callers race with slightly stale clocks.
        let stamp = hits.back().map_or(now, |&last| last.max(now));
        hits.push_back(stamp);
        return Verdict::admit(limit, limit - count - 1);
    }

    let retry_after = hits.front().map_or(window, |&oldest| {
        window.saturating_sub(now.saturating_duration_since(oldest))
    });
    Verdict::deny(limit, retry_after)
}

fn check_counter(
    window_start: &mut Instant,
    current: &mut u32,
    previous: &mut u32,
    limit: u32,
    window: Duration,
    now: Instant,
) -> Verdict {
    (*window_start, *current, *previous) =
        roll_counter(*window_start, *current, *previous, window, now);

    let load = estimate(*window_start, *current, *previous, window, now);
    let limit_f = f64::from(limit);
    if load < limit_f {
        *current += 1;
        let remaining = (limit_f - (load + 1.0)).ceil().max(0.0) as u32;
        return Verdict::admit(limit, remaining);
    }

    let elapsed = now.saturating_duration_since(*window_start);
    let candidate = if *current < limit {
        // Only the previous window's share is in the way; wait for it to
        // decay below the headroom left in the current window.
        let headroom = f64::from(limit - *current) / f64::from((*previous).max(1));
        window
            .mul_f64((1.0 - headroom).max(0.0))
            .saturating_sub(elapsed)
    } else {
        // The current window alone is full; it has to roll over and then
        // decay as the previous window.
        let excess = 1.0 - limit_f / f64::from(*current);
        window.saturating_sub(elapsed) + window.mul_f64(excess.max(0.0))
    };

    // The candidate is where the estimate equals the limit; admission needs
    // it strictly below, so step forward until a retry would be admitted.
    let mut retry_after = candidate + Duration::from_nanos(1);
    let mut step = Duration::from_nanos(1);
    while !admissible_at(*window_start, *current, *previous, limit, window, now + retry_after) {
        retry_after += step;
        step = step.saturating_mul(2);
    }
    Verdict::deny(limit, retry_after)
}

fn admissible_at(
    window_start: Instant,
    current: u32,
    previous: u32,
    limit: u32,
    window: Duration,
    at: Instant,
) -> bool {
    let (start, current, previous) = roll_counter(window_start, current, previous, window, at);
    estimate(start, current, previous, window, at) < f64::from(limit)
}

/// Advance a fixed-window pair so that `now` falls inside the current window.
fn roll_counter(
    window_start: Instant,
    current: u32,
    previous: u32,
    window: Duration,
    now: Instant,
) -> (Instant, u32, u32) {
    let elapsed = now.saturating_duration_since(window_start);
    if elapsed < window {
        return (window_start, current, previous);
    }

    let window_nanos = window.as_nanos();
    let windows_passed = elapsed.as_nanos() / window_nanos;
    let into_window = Duration::from_nanos((elapsed.as_nanos() % window_nanos) as u64);
    let previous = if windows_passed == 1 { current } else { 0 };
    (now - into_window, 0, previous)
}

fn estimate(
    window_start: Instant,
    current: u32,
    previous: u32,
    window: Duration,
    now: Instant,
) -> f64 {
    let elapsed = now.saturating_duration_since(window_start);
    let overlap = (1.0 - elapsed.as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0);
    f64::from(current) + f64::from(previous) * overlap
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    fn secs(base: Instant, s: f64) -> Instant {
        base + Duration::from_secs_f64(s)
    }

    #[test]
    fn test_log_example_scenario() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);

        let verdicts: Vec<Verdict> = (0..4)
            .map(|t| record.check(3, WINDOW, secs(base, f64::from(t))))
            .collect();

        let admitted: Vec<bool> = verdicts.iter().map(|v| v.admitted).collect();
        let remaining: Vec<u32> = verdicts.iter().map(|v| v.remaining).collect();
        assert_eq!(admitted, vec![true, true, true, false]);
        assert_eq!(remaining, vec![2, 1, 0, 0]);
        assert_eq!(verdicts[3].retry_after, Duration::from_secs(57));
        assert!(verdicts[..3].iter().all(|v| v.retry_after.is_zero()));
    }

    #[test]
    fn test_log_retry_after_is_honored() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);
        for t in 0..3 {
            record.check(3, WINDOW, secs(base, f64::from(t)));
        }

        let denied = record.check(3, WINDOW, secs(base, 3.5));
        assert!(!denied.admitted);
        assert!(record.check(3, WINDOW, secs(base, 3.5) + denied.retry_after).admitted);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "accounted 5 requests against a limit of 3")]
    fn test_overfull_record_trips_invariant_check() {
        let base = Instant::now();
        let mut record = UsageRecord::with_hits(vec![base; 5], base);
        record.check(3, WINDOW, base);
    }

    #[test]
    fn test_log_exact_limit_per_window() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);

        let admitted = (0..50)
            .filter(|i| record.check(10, WINDOW, secs(base, f64::from(*i) * 0.5)).admitted)
            .count();
        assert_eq!(admitted, 10);
        assert_eq!(record.count(), 10);
    }

    #[test]
    fn test_log_no_boundary_burst() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);
        let limit = 100;

        let before = (0..limit)
            .filter(|_| record.check(limit, WINDOW, secs(base, 59.9)).admitted)
            .count();
        let after = (0..limit)
            .filter(|_| record.check(limit, WINDOW, secs(base, 60.1)).admitted)
            .count();

        assert_eq!(before, 100);
        assert_eq!(after, 0);

        // Slots free once the first burst has aged out.
        assert!(record.check(limit, WINDOW, secs(base, 120.0)).admitted);
    }

    #[test]
    fn test_log_hit_exactly_one_window_old_expires() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);

        assert!(record.check(1, WINDOW, base).admitted);
        assert!(!record.check(1, WINDOW, secs(base, 59.0)).admitted);
        assert!(record.check(1, WINDOW, base + WINDOW).admitted);
    }

    #[test]
    fn test_log_denied_requests_do_not_extend_lockout() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);

        assert!(record.check(1, WINDOW, base).admitted);
        for t in 1..60 {
            assert!(!record.check(1, WINDOW, secs(base, f64::from(t))).admitted);
        }
        assert_eq!(record.count(), 1);
        assert!(record.check(1, WINDOW, secs(base, 60.0)).admitted);
    }

    #[test]
    fn test_log_stale_clock_keeps_order() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);

        assert!(record.check(2, WINDOW, secs(base, 10.0)).admitted);
        // A racing caller that read the clock earlier.
        assert!(record.check(2, WINDOW, secs(base, 9.0)).admitted);
        let denied = record.check(2, WINDOW, secs(base, 11.0));
        assert!(!denied.admitted);
        assert_eq!(denied.retry_after, Duration::from_secs(59));
        assert_eq!(record.last_seen(), secs(base, 11.0));
    }

    #[test]
    fn test_log_usage_is_read_only() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingLog, base);
        record.check(5, WINDOW, base);
        record.check(5, WINDOW, secs(base, 30.0));

        assert_eq!(record.usage(WINDOW, secs(base, 31.0)), 2);
        assert_eq!(record.usage(WINDOW, secs(base, 61.0)), 1);
        assert_eq!(record.usage(WINDOW, secs(base, 91.0)), 0);
        assert_eq!(record.count(), 2);
    }

    #[test]
    fn test_counter_admits_up_to_limit() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingCounter, base);

        let verdicts: Vec<Verdict> = (0..4)
            .map(|t| record.check(3, WINDOW, secs(base, f64::from(t))))
            .collect();
        let admitted: Vec<bool> = verdicts.iter().map(|v| v.admitted).collect();
        let remaining: Vec<u32> = verdicts.iter().map(|v| v.remaining).collect();
        assert_eq!(admitted, vec![true, true, true, false]);
        assert_eq!(remaining, vec![2, 1, 0, 0]);
        // At rollover the full window still weighs exactly the limit, so the
        // first slot frees just after it.
        let retry_after = verdicts[3].retry_after;
        assert!(retry_after > Duration::from_secs(57));
        assert!(retry_after < Duration::from_secs(57) + Duration::from_millis(1));

        let retry = record.check(3, WINDOW, secs(base, 3.0) + retry_after);
        assert!(retry.admitted, "retry at the hinted time denied: {:?}", retry);
    }

    #[test]
    fn test_counter_weights_previous_window() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingCounter, base);
        let limit = 10;

        for _ in 0..limit {
            assert!(record.check(limit, WINDOW, secs(base, 1.0)).admitted);
        }

        // A quarter into the next window the previous window still weighs 7.5.
        let admitted = (0..limit)
            .filter(|_| record.check(limit, WINDOW, secs(base, 75.0)).admitted)
            .count();
        assert_eq!(admitted, 3);

        // 3 + 10 * (1 - x) < 10 once x > 0.3, i.e. 18s into the window.
        let denied = record.check(limit, WINDOW, secs(base, 75.0));
        assert!(!denied.admitted);
        assert_eq!(denied.remaining, 0);
        let retry_ms = denied.retry_after.as_millis();
        assert!((2_999..=3_001).contains(&retry_ms), "retry after {}ms", retry_ms);

        let retry = record.check(limit, WINDOW, secs(base, 75.0) + denied.retry_after);
        assert!(retry.admitted, "retry at the hinted time denied: {:?}", retry);
    }

    #[test]
    fn test_counter_no_boundary_burst() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingCounter, base);
        let limit = 100;

        let before = (0..limit)
            .filter(|_| record.check(limit, WINDOW, secs(base, 59.9)).admitted)
            .count();
        let after = (0..limit)
            .filter(|_| record.check(limit, WINDOW, secs(base, 60.1)).admitted)
            .count();

        assert_eq!(before, 100);
        // The previous window still overlaps almost entirely.
        assert!(after <= 1, "admitted {} right after the boundary", after);
    }

    #[test]
    fn test_counter_resets_after_two_idle_windows() {
        let base = Instant::now();
        let mut record = UsageRecord::new(Algorithm::SlidingCounter, base);
        for _ in 0..3 {
            record.check(3, WINDOW, base);
        }
        assert_eq!(record.usage(WINDOW, secs(base, 150.0)), 0);
        let verdict = record.check(3, WINDOW, secs(base, 150.0));
        assert!(verdict.admitted);
        assert_eq!(verdict.remaining, 2);
    }

    #[test]
    fn test_is_idle_requires_retention_and_drained_window() {
        let base = Instant::now();
        let retention = WINDOW * 2;

        let mut log = UsageRecord::new(Algorithm::SlidingLog, base);
        log.check(5, WINDOW, base);
        assert!(!log.is_idle(secs(base, 60.0), WINDOW, retention));
        assert!(log.is_idle(secs(base, 120.0), WINDOW, retention));

        let mut counter = UsageRecord::new(Algorithm::SlidingCounter, base);
        counter.check(5, WINDOW, secs(base, 30.0));
        // Retention elapsed, but the hit still weighs on the next window.
        assert!(!counter.is_idle(secs(base, 100.0), WINDOW, WINDOW));
        assert!(counter.is_idle(secs(base, 120.0), WINDOW, WINDOW));
    }

    #[test]
    fn test_algorithm_serde_names() {
        let algo: Algorithm = serde_yaml::from_str("sliding_counter").unwrap();
        assert_eq!(algo, Algorithm::SlidingCounter);
        let algo: Algorithm = serde_yaml::from_str("sliding_log").unwrap();
        assert_eq!(algo, Algorithm::SlidingLog);
    }
}
