//! Cardinality bounding for metric label values.
//!
//! Unbounded label cardinality is the primary failure mode a metrics pipeline
//! must defend against: one `user_id` label can mint millions of series and
//! take the backend down. The [`CardinalityLimiter`] tracks the distinct
//! values seen per configured label key and rewrites overflow values to the
//! sentinel `"other"`, so the series count stays bounded while the signal for
//! hot values is preserved.
//!
//! Keys without a configured limit bypass the limiter entirely. A background
//! task evicts values that have not been seen for ten minutes so that churny
//! labels (pod names, request ids that slipped through) recycle their budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

/// Rewritten value for observations past a key's limit
pub const OVERFLOW_VALUE: &str = "other";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_EVICTION_AGE: Duration = Duration::from_secs(10 * 60);

/// Per-label-key bounded sets of observed values.
///
/// `limit_value` is the hot path: it returns the candidate unchanged when the
/// key is unlimited, already tracked, or under budget, and `"other"`
/// otherwise. All state lives behind one mutex; buckets are small and the
/// critical section is a map probe.
pub struct CardinalityLimiter {
    limits: HashMap<String, usize>,
    buckets: Arc<Mutex<HashMap<String, HashMap<String, Instant>>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl CardinalityLimiter {
    /// Create a limiter with a default per-key limit and per-key overrides.
    ///
    /// A `default_limit` of zero disables the default, leaving only the keys
    /// named in `per_key_limits` bounded.
    pub fn new(default_limit: usize, per_key_limits: &HashMap<String, usize>) -> Self {
        let mut limits = per_key_limits.clone();
        if default_limit > 0 {
            for key in ["user_id", "session_id", "request_id", "trace_id"] {
                limits.entry(key.to_string()).or_insert(default_limit);
            }
        }
        Self {
            limits,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Spawn the periodic eviction task. A no-op outside a tokio runtime;
    /// callers without one keep a working limiter minus background eviction.
    pub fn start_cleanup(&self) {
        let mut task = self.cleanup_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no tokio runtime, skipping cardinality cleanup task");
            return;
        };
        let buckets = self.buckets.clone();
        *task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::evict_idle(&buckets, IDLE_EVICTION_AGE);
            }
        }));
    }

    /// Apply the limit for `key` to `value`, returning the value to emit.
    pub fn limit_value(&self, metric: &str, key: &str, value: &str) -> String {
        let limit = match self.limits.get(key) {
            Some(limit) => *limit,
            None => return value.to_string(),
        };

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key.to_string()).or_default();

        if let Some(last_seen) = bucket.get_mut(value) {
            *last_seen = Instant::now();
            return value.to_string();
        }

        if bucket.len() < limit {
            bucket.insert(value.to_string(), Instant::now());
            return value.to_string();
        }

        debug!(
            metric = metric,
            label_key = key,
            limit = limit,
            "label value over cardinality limit, rewriting to '{}'",
            OVERFLOW_VALUE
        );
        OVERFLOW_VALUE.to_string()
    }

    /// Total distinct values currently tracked across all keys
    pub fn current_cardinality(&self) -> usize {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.values().map(|bucket| bucket.len()).sum()
    }

    /// Sum of configured limits across all keys
    pub fn max_cardinality(&self) -> usize {
        self.limits.values().sum()
    }

    /// Stop the cleanup task. Idempotent.
    pub fn stop(&self) {
        let mut task = self.cleanup_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    fn evict_idle(buckets: &Mutex<HashMap<String, HashMap<String, Instant>>>, max_age: Duration) {
        let mut buckets = buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut evicted = 0usize;
        for bucket in buckets.values_mut() {
            let before = bucket.len();
            bucket.retain(|_, last_seen| now.duration_since(*last_seen) < max_age);
            evicted += before - bucket.len();
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
        if evicted > 0 {
            debug!(evicted = evicted, "evicted idle cardinality entries");
        }
    }
}

impl Drop for CardinalityLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}
