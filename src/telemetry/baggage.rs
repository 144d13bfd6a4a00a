//! Context-bound baggage with W3C limits and deterministic label merging.
//!
//! Baggage is request-scoped key/value metadata that rides inside an
//! [`opentelemetry::Context`] and crosses process boundaries through the W3C
//! `baggage` header. Within a process it is merged into every metric emitted
//! with that context, so a `tenant` set at the edge shows up on series
//! emitted three calls deep.
//!
//! Two properties make this safe at scale:
//!
//! - **Bounded size.** The W3C limits are enforced on write: at most 64
//!   items, keys up to 128 bytes, values up to 512 bytes, 8 KiB total. A
//!   write that would exceed a limit leaves the original context unchanged
//!   and bumps the process-wide drop counter, so a misbehaving caller cannot
//!   grow headers without bound.
//! - **Deterministic series identity.** Merged label slices are key-sorted,
//!   so identical semantic labels produce byte-identical series regardless of
//!   the order callers supplied them in.
//!
//! Merge buffers are pooled; see [`return_label_slice`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use opentelemetry::Context;

/// W3C baggage limits
pub const MAX_BAGGAGE_ITEMS: usize = 64;
pub const MAX_BAGGAGE_KEY_BYTES: usize = 128;
pub const MAX_BAGGAGE_VALUE_BYTES: usize = 512;
pub const MAX_BAGGAGE_TOTAL_BYTES: usize = 8 * 1024;

/// Slices larger than this are dropped instead of pooled, so one huge
/// emission cannot pin memory for the life of the process.
const MAX_POOLED_SLICE_LEN: usize = 512;

/// Baggage map attached to a `Context`. Immutable; mutation clones.
#[derive(Debug, Clone, Default)]
struct BaggageMap(HashMap<String, String>);

static ITEMS_ADDED: AtomicU64 = AtomicU64::new(0);
static ITEMS_DROPPED: AtomicU64 = AtomicU64::new(0);
static OVER_LIMIT: AtomicU64 = AtomicU64::new(0);
static CURRENT_SIZE: AtomicU64 = AtomicU64::new(0);

static LABEL_POOL: Lazy<Mutex<Vec<Vec<String>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Process-wide baggage counters. All monotonically increasing except
/// `current_size`, which tracks the byte size of the most recent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaggageStats {
    pub items_added: u64,
    pub items_dropped: u64,
    pub over_limit: u64,
    pub current_size: u64,
}

/// Attach key/value pairs to the context's baggage, returning the new
/// context.
///
/// Pairs with empty keys are rejected individually (counted as drops). If the
/// resulting baggage would exceed the item count or total size limit, the
/// write is abandoned: the returned context is the original one, unchanged.
pub fn with_baggage(ctx: &Context, pairs: &[(&str, &str)]) -> Context {
    let existing = baggage_of(ctx);
    let mut merged = existing.clone();
    let mut added = 0u64;

    for (key, value) in pairs {
        if key.is_empty()
            || key.len() > MAX_BAGGAGE_KEY_BYTES
            || value.len() > MAX_BAGGAGE_VALUE_BYTES
        {
            ITEMS_DROPPED.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        merged.insert(key.to_string(), value.to_string());
        added += 1;
    }

    if added == 0 {
        return ctx.clone();
    }

    let total: usize = merged.iter().map(|(k, v)| k.len() + v.len()).sum();
    if merged.len() > MAX_BAGGAGE_ITEMS || total > MAX_BAGGAGE_TOTAL_BYTES {
        OVER_LIMIT.fetch_add(1, Ordering::Relaxed);
        ITEMS_DROPPED.fetch_add(added, Ordering::Relaxed);
        return ctx.clone();
    }

    ITEMS_ADDED.fetch_add(added, Ordering::Relaxed);
    CURRENT_SIZE.store(total as u64, Ordering::Relaxed);
    ctx.with_value(BaggageMap(merged))
}

/// Read the baggage carried by the context. Returns an owned copy; the
/// context itself is never mutated.
pub fn get_baggage(ctx: &Context) -> HashMap<String, String> {
    baggage_of(ctx)
}

/// Process-wide baggage statistics
pub fn baggage_stats() -> BaggageStats {
    BaggageStats {
        items_added: ITEMS_ADDED.load(Ordering::Relaxed),
        items_dropped: ITEMS_DROPPED.load(Ordering::Relaxed),
        over_limit: OVER_LIMIT.load(Ordering::Relaxed),
        current_size: CURRENT_SIZE.load(Ordering::Relaxed),
    }
}

/// Merge baggage over caller-supplied labels into a pooled, key-sorted,
/// alternating key/value slice.
///
/// Baggage wins on key collisions. An odd trailing key in `labels` is
/// dropped. Callers hand the slice back via [`return_label_slice`] once the
/// emission is recorded.
pub fn append_baggage_to_labels(ctx: &Context, labels: &[String]) -> Vec<String> {
    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();

    for chunk in labels.chunks_exact(2) {
        merged.insert(chunk[0].as_str(), chunk[1].as_str());
    }

    let baggage = ctx.get::<BaggageMap>();
    if let Some(BaggageMap(map)) = baggage {
        for (key, value) in map {
            merged.insert(key.as_str(), value.as_str());
        }
    }

    let mut out = take_label_slice();
    out.reserve(merged.len() * 2);
    for (key, value) in merged {
        out.push(key.to_string());
        out.push(value.to_string());
    }
    out
}

/// Return a merge buffer to the pool. Oversized slices are dropped.
pub fn return_label_slice(mut slice: Vec<String>) {
    if slice.len() > MAX_POOLED_SLICE_LEN || slice.capacity() > MAX_POOLED_SLICE_LEN * 2 {
        return;
    }
    slice.clear();
    let mut pool = LABEL_POOL.lock().unwrap_or_else(|e| e.into_inner());
    if pool.len() < 64 {
        pool.push(slice);
    }
}

fn take_label_slice() -> Vec<String> {
    let mut pool = LABEL_POOL.lock().unwrap_or_else(|e| e.into_inner());
    pool.pop().unwrap_or_default()
}

fn baggage_of(ctx: &Context) -> HashMap<String, String> {
    ctx.get::<BaggageMap>()
        .map(|BaggageMap(map)| map.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_baggage_round_trip() {
        let ctx = Context::new();
        let ctx = with_baggage(&ctx, &[("tenant", "acme"), ("region", "eu-west-1")]);
        let baggage = get_baggage(&ctx);
        assert_eq!(baggage.get("tenant").map(String::as_str), Some("acme"));
        assert_eq!(baggage.get("region").map(String::as_str), Some("eu-west-1"));
    }

    #[test]
    fn test_original_context_unchanged() {
        let base = with_baggage(&Context::new(), &[("a", "1")]);
        let _derived = with_baggage(&base, &[("b", "2")]);
        let baggage = get_baggage(&base);
        assert_eq!(baggage.len(), 1);
        assert!(!baggage.contains_key("b"));
    }

    #[test]
    fn test_empty_keys_rejected() {
        let before = baggage_stats().items_dropped;
        let ctx = with_baggage(&Context::new(), &[("", "value"), ("ok", "value")]);
        let baggage = get_baggage(&ctx);
        assert_eq!(baggage.len(), 1);
        assert!(baggage.contains_key("ok"));
        assert!(baggage_stats().items_dropped > before);
    }

    #[test]
    fn test_over_limit_write_leaves_context_unchanged() {
        let base = with_baggage(&Context::new(), &[("seed", "value")]);

        let keys: Vec<String> = (0..(2 * MAX_BAGGAGE_ITEMS)).map(|i| format!("k{}", i)).collect();
        let pairs: Vec<(&str, &str)> = keys.iter().map(|k| (k.as_str(), "v")).collect();

        let before = baggage_stats();
        let after_ctx = with_baggage(&base, &pairs);
        let after = baggage_stats();

        // Context unchanged, drops counted, size stays bounded
        assert_eq!(get_baggage(&after_ctx), get_baggage(&base));
        assert!(after.over_limit > before.over_limit);
        assert!(after.items_dropped > before.items_dropped);
        assert!(after.current_size <= MAX_BAGGAGE_TOTAL_BYTES as u64);
    }

    #[test]
    fn test_oversized_value_dropped() {
        let huge = "x".repeat(MAX_BAGGAGE_VALUE_BYTES + 1);
        let ctx = with_baggage(&Context::new(), &[("key", huge.as_str())]);
        assert!(get_baggage(&ctx).is_empty());
    }

    #[test]
    fn test_label_merge_sorted_and_deterministic() {
        let ctx = with_baggage(&Context::new(), &[("zeta", "z"), ("alpha", "a")]);
        let labels = vec![
            "method".to_string(),
            "GET".to_string(),
            "code".to_string(),
            "200".to_string(),
        ];

        let first = append_baggage_to_labels(&ctx, &labels);
        let second = append_baggage_to_labels(&ctx, &labels);
        assert_eq!(first, second);

        // Keys come out in ascending order
        let keys: Vec<&String> = first.iter().step_by(2).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        return_label_slice(first);
        return_label_slice(second);
    }

    #[test]
    fn test_baggage_overrides_caller_labels() {
        let ctx = with_baggage(&Context::new(), &[("tenant", "from-baggage")]);
        let labels = vec!["tenant".to_string(), "from-caller".to_string()];
        let merged = append_baggage_to_labels(&ctx, &labels);
        let position = merged.iter().position(|l| l == "tenant").unwrap();
        assert_eq!(merged[position + 1], "from-baggage");
        return_label_slice(merged);
    }

    #[test]
    fn test_odd_trailing_label_dropped() {
        let merged = append_baggage_to_labels(
            &Context::new(),
            &["a".to_string(), "1".to_string(), "dangling".to_string()],
        );
        assert_eq!(merged, vec!["a".to_string(), "1".to_string()]);
        return_label_slice(merged);
    }

    #[test]
    fn test_oversized_slice_not_pooled() {
        let big: Vec<String> = (0..(MAX_POOLED_SLICE_LEN + 2)).map(|i| i.to_string()).collect();
        // Must not panic, must not end up reused
        return_label_slice(big);
        let reused = take_label_slice();
        assert!(reused.len() <= MAX_POOLED_SLICE_LEN);
        return_label_slice(reused);
    }
}
