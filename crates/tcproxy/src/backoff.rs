//! Exponential backoff policy for outbound retries.
//!
//! Transient network failures talking to the backend are retried with
//! exponentially growing, jittered intervals until a maximum elapsed
//! time is reached. HTTP-level error responses are never retried: a
//! signed request carries a timestamp and nonce, so replaying one that
//! the backend already answered is both unsafe and wasteful.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Configurable retry policy. All intervals are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Random jitter applied to each interval, as a fraction of the
    /// interval. 0.0 disables jitter; 0.2 yields [0.8x, 1.2x].
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,

    /// Growth factor between consecutive intervals.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Cap on a single interval.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Total time budget. Once exceeded, the last error is surfaced.
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

fn default_initial_interval_ms() -> u64 {
    200
}

fn default_randomization_factor() -> f64 {
    0.25
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    5_000
}

fn default_max_elapsed_ms() -> u64 {
    30_000
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            randomization_factor: default_randomization_factor(),
            multiplier: default_multiplier(),
            max_interval_ms: default_max_interval_ms(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

impl ExponentialBackoff {
    /// Begin a retry sequence. Each call starts a fresh elapsed-time clock.
    #[must_use]
    pub fn start(&self) -> BackoffAttempts {
        BackoffAttempts {
            policy: self.clone(),
            current: Duration::from_millis(self.initial_interval_ms),
            started: Instant::now(),
        }
    }
}

/// State of one retry sequence.
#[derive(Debug)]
pub struct BackoffAttempts {
    policy: ExponentialBackoff,
    current: Duration,
    started: Instant,
}

impl BackoffAttempts {
    /// The next interval to sleep before retrying, or `None` once the
    /// elapsed-time budget is spent.
    pub fn next_interval(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= Duration::from_millis(self.policy.max_elapsed_ms) {
            return None;
        }

        let interval = jitter(self.current, self.policy.randomization_factor);

        let next = self.current.as_secs_f64() * self.policy.multiplier;
        let cap = Duration::from_millis(self.policy.max_interval_ms);
        self.current = Duration::from_secs_f64(next).min(cap);

        Some(interval)
    }
}

/// Apply random jitter: `interval * [1 - factor, 1 + factor]`.
fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let scale = 1.0 - factor + 2.0 * factor * rand_unit();
    Duration::from_secs_f64(interval.as_secs_f64() * scale)
}

/// A uniform sample in [0, 1) from the system RNG.
fn rand_unit() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return 0.5;
    }
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval_ms: 100,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval_ms: 400,
            max_elapsed_ms: 60_000,
        }
    }

    #[test]
    fn test_intervals_grow_and_cap() {
        let mut attempts = no_jitter_policy().start();
        assert_eq!(attempts.next_interval().unwrap(), Duration::from_millis(100));
        assert_eq!(attempts.next_interval().unwrap(), Duration::from_millis(200));
        assert_eq!(attempts.next_interval().unwrap(), Duration::from_millis(400));
        // Capped at max_interval from here on
        assert_eq!(attempts.next_interval().unwrap(), Duration::from_millis(400));
    }

    #[test]
    fn test_elapsed_budget_exhausts() {
        let policy = ExponentialBackoff {
            max_elapsed_ms: 0,
            ..no_jitter_policy()
        };
        let mut attempts = policy.start();
        assert!(attempts.next_interval().is_none());
    }

    #[test]
    fn test_jitter_bounds() {
        let interval = Duration::from_millis(1_000);
        for _ in 0..100 {
            let jittered = jitter(interval, 0.2);
            assert!(jittered >= Duration::from_millis(800));
            assert!(jittered <= Duration::from_millis(1_200));
        }
    }

    #[test]
    fn test_rand_unit_in_range() {
        for _ in 0..100 {
            let sample = rand_unit();
            assert!((0.0..1.0).contains(&sample));
        }
    }

    #[test]
    fn test_default_policy_roundtrips_through_json() {
        let policy = ExponentialBackoff::default();
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: ExponentialBackoff = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.initial_interval_ms, policy.initial_interval_ms);
        assert_eq!(parsed.max_elapsed_ms, policy.max_elapsed_ms);
    }
}
