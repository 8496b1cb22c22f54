//! The two independent rate limiters described in spec §3/§4.1.
//!
//! - [`BackoffLimiter`] paces *retries after a handler error*: exponential, 500ms up to
//!   a 15 minute cap, keyed per `(gvk, key)`, reset once a reconciliation succeeds.
//! - [`FairnessLimiter`] paces *all* non-trigger, non-replay dispatch of a key so that a
//!   storm of legitimate watch events can't starve a worker pool: a token bucket at
//!   ~1 token per 15s with a burst of 10, plus a "waiting" flag so that a second
//!   exhausted attempt doesn't schedule a second deferred replay (§3 "Rate-limiter
//!   state").
//!
//! Neither of these exists as reusable library code in the original source (it leans
//! on client-go's `workqueue.RateLimiter`, an external dependency there); they're
//! written here directly from the spec's prose description, using the `backoff` crate
//! already in the dependency graph for the exponential half.

use backoff::{backoff::Backoff, exponential::ExponentialBackoff, SystemClock};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(15 * 60);

const FAIRNESS_INTERVAL: Duration = Duration::from_secs(15);
const FAIRNESS_BURST: u32 = 10;

fn new_backoff() -> ExponentialBackoff<SystemClock> {
    ExponentialBackoff {
        current_interval: BACKOFF_INITIAL,
        initial_interval: BACKOFF_INITIAL,
        multiplier: 2.0,
        max_interval: BACKOFF_MAX,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Exponential backoff for handler-error retries, keyed per item.
pub struct BackoffLimiter<K> {
    state: Mutex<HashMap<K, ExponentialBackoff<SystemClock>>>,
}

impl<K> Default for BackoffLimiter<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> BackoffLimiter<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn next_backoff(&self, key: &K) -> Duration {
        let mut state = self.state.lock();
        let backoff = state.entry(key.clone()).or_insert_with(new_backoff);
        backoff.next_backoff().unwrap_or(BACKOFF_MAX)
    }

    /// Forget all accumulated backoff state for `key`.
    ///
    /// Called on reconciliation success (so the next failure starts cold again), and
    /// on a terminal error (decision recorded in DESIGN.md: a terminal error can't be
    /// fixed by retrying on a timer, so there is no reason to keep inflating the delay
    /// a client-triggered retry would face once the blocker clears).
    pub fn forget(&self, key: &K) {
        self.state.lock().remove(key);
    }
}

/// Per-key state for the fairness limiter: a token bucket plus a waiting flag.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    waiting: bool,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            tokens: f64::from(FAIRNESS_BURST),
            last_refill: now,
            waiting: false,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refilled = elapsed.as_secs_f64() / FAIRNESS_INTERVAL.as_secs_f64();
        self.tokens = (self.tokens + refilled).min(f64::from(FAIRNESS_BURST));
        self.last_refill = now;
    }
}

/// The outcome of asking the fairness limiter for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was available; dispatch may proceed immediately.
    Allow,
    /// No token was available. `delay` is how long until one will be; `already_waiting`
    /// reports whether a previous caller already scheduled a replay for this key, so
    /// the caller should coalesce rather than scheduling a second one (§4.1 step 3).
    Defer { delay: Duration, already_waiting: bool },
}

/// A token-bucket fairness limiter, rate ~1/15s with a burst of 10, shared across all
/// keys of a single work queue.
pub struct FairnessLimiter<K> {
    buckets: Mutex<HashMap<K, Bucket>>,
}

impl<K> Default for FairnessLimiter<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> FairnessLimiter<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take one token for `key`.
    pub fn admit(&self, key: &K) -> Admission {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket::new(now));
        bucket.refill(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.waiting = false;
            return Admission::Allow;
        }

        let already_waiting = bucket.waiting;
        bucket.waiting = true;
        let missing = 1.0 - bucket.tokens;
        let delay = Duration::from_secs_f64(missing * FAIRNESS_INTERVAL.as_secs_f64());
        Admission::Defer {
            delay,
            already_waiting,
        }
    }

    /// Clear the waiting flag for `key` once its deferred replay has been scheduled or
    /// has fired, so a subsequent exhaustion can schedule a fresh one.
    pub fn clear_waiting(&self, key: &K) {
        if let Some(bucket) = self.buckets.lock().get_mut(key) {
            bucket.waiting = false;
        }
    }
}

/// Convenience alias: the limiters this crate actually instantiates are always keyed
/// by `(GroupVersionKind, Key)`-shaped tuples behind an `Arc` so dispatcher workers can
/// share one instance per queue.
pub type SharedBackoffLimiter<K> = Arc<BackoffLimiter<K>>;
/// See [`SharedBackoffLimiter`].
pub type SharedFairnessLimiter<K> = Arc<FairnessLimiter<K>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_resets() {
        let limiter: BackoffLimiter<&str> = BackoffLimiter::new();
        let first = limiter.next_backoff(&"k");
        let second = limiter.next_backoff(&"k");
        assert!(second >= first);
        limiter.forget(&"k");
        let after_reset = limiter.next_backoff(&"k");
        assert_eq!(after_reset, first);
    }

    #[test]
    fn fairness_allows_burst_then_defers() {
        let limiter: FairnessLimiter<&str> = FairnessLimiter::new();
        for _ in 0..FAIRNESS_BURST {
            assert_eq!(limiter.admit(&"k"), Admission::Allow);
        }
        match limiter.admit(&"k") {
            Admission::Defer { already_waiting, .. } => assert!(!already_waiting),
            Admission::Allow => panic!("burst should be exhausted"),
        }
        match limiter.admit(&"k") {
            Admission::Defer { already_waiting, .. } => assert!(already_waiting),
            Admission::Allow => panic!("still exhausted"),
        }
    }

    #[test]
    fn fairness_is_independent_per_key() {
        let limiter: FairnessLimiter<&str> = FairnessLimiter::new();
        for _ in 0..FAIRNESS_BURST {
            assert_eq!(limiter.admit(&"a"), Admission::Allow);
        }
        assert_eq!(limiter.admit(&"b"), Admission::Allow);
    }
}
