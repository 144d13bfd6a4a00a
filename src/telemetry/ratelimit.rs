//! Bounded-frequency admission for self-observation paths.
//!
//! The telemetry plane observes itself: error logs, export failures, and
//! breaker transitions all want to reach the operator without flooding them
//! when a backend is down. [`RateLimiter`] caps how often a path fires.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Allows at most one admission per configured interval.
///
/// The first call always succeeds. Safe for concurrent use.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last_allowed: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_allowed: Mutex::new(None),
        }
    }

    /// One admission per second, the default for error-log throttling
    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Returns true when enough time has passed since the last admission,
    /// and records the admission.
    pub fn allow(&self) -> bool {
        let mut last = match self.last_allowed.lock() {
            Ok(guard) => guard,
            // A poisoned lock means a panicking holder; fail open so the
            // caller's log line is not silently dropped.
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        match *last {
            Some(previous) if now.duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
