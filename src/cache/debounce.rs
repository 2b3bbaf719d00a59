//! Per-operation rate limiting of remote calls
//!
//! Each operation may carry a minimum interval between remote invocations. A miss
//! arriving inside that interval is deferred: it is served from the most recent
//! result recorded for the same key when one exists, and otherwise waits for the
//! interval to run out before calling the remote.

use crate::cache::config::CacheConfig;
use crate::cache::invalidation::InvalidationTarget;
use crate::cache::types::{CacheKey, Category};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct Recent<V> {
    value: V,
    category: Category,
    valid_until: Instant,
}

struct DebounceState<V> {
    attempts: HashMap<String, Instant>,
    recent: HashMap<CacheKey, Recent<V>>,
}

/// Tracks recent remote invocations per operation
pub struct Debouncer<V> {
    intervals: HashMap<String, Duration>,
    default_interval: Option<Duration>,
    state: Mutex<DebounceState<V>>,
}

impl<V: Clone> Debouncer<V> {
    /// Debouncer applying `default_interval` to every operation
    pub fn new(default_interval: Option<Duration>) -> Self {
        Self {
            intervals: HashMap::new(),
            default_interval: default_interval.filter(|d| !d.is_zero()),
            state: Mutex::new(DebounceState {
                attempts: HashMap::new(),
                recent: HashMap::new(),
            }),
        }
    }

    /// Debouncer using the intervals of every configured operation policy
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut debouncer = Self::new(config.default_min_interval);
        for (operation, policy) in &config.operations {
            if let Some(interval) = policy.min_interval {
                debouncer = debouncer.with_interval(operation.clone(), interval);
            }
        }
        debouncer
    }

    /// Set the minimum interval of one operation
    pub fn with_interval(mut self, operation: impl Into<String>, interval: Duration) -> Self {
        self.intervals.insert(operation.into(), interval);
        self
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Minimum interval of `operation`, if it is debounced at all
    pub fn interval_for(&self, operation: &str) -> Option<Duration> {
        self.intervals
            .get(operation)
            .copied()
            .or(self.default_interval)
            .filter(|d| !d.is_zero())
    }

    /// Whether a remote call for `operation` happened less than its interval ago
    pub fn should_defer(&self, operation: &str, now: Instant) -> bool {
        self.remaining(operation, now).is_some()
    }

    /// Time left until `operation` may call the remote again
    pub fn remaining(&self, operation: &str, now: Instant) -> Option<Duration> {
        let interval = self.interval_for(operation)?;
        let last = *self.lock().attempts.get(operation)?;
        let elapsed = now.saturating_duration_since(last);

        if elapsed < interval {
            Some(interval - elapsed)
        } else {
            None
        }
    }

    /// Note that a remote call for `operation` was issued at `now`
    pub fn record_attempt(&self, operation: &str, now: Instant) {
        if self.interval_for(operation).is_some() {
            self.lock().attempts.insert(operation.to_string(), now);
        }
    }

    /// Keep a successful result around for the operation's interval
    pub fn remember(&self, key: &CacheKey, operation: &str, category: &Category, value: V, now: Instant) {
        let Some(interval) = self.interval_for(operation) else {
            return;
        };

        let mut state = self.lock();
        state.recent.retain(|_, r| r.valid_until > now);
        state.recent.insert(
            key.clone(),
            Recent {
                value,
                category: category.clone(),
                valid_until: now + interval,
            },
        );
    }

    /// Most recent result for `key`, if still inside its interval
    pub fn recent(&self, key: &CacheKey, now: Instant) -> Option<V> {
        let mut state = self.lock();
        let valid = state.recent.get(key)?.valid_until > now;
        if !valid {
            state.recent.remove(key);
            return None;
        }
        state.recent.get(key).map(|r| r.value.clone())
    }

    /// Drop remembered results matching `target`
    pub fn forget(&self, target: &InvalidationTarget) -> usize {
        let mut state = self.lock();
        let before = state.recent.len();
        state.recent.retain(|key, r| !target.matches(key, &r.category));
        let dropped = before - state.recent.len();

        if dropped > 0 {
            debug!("Forgot {} debounced results", dropped);
        }
        dropped
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.attempts.clear();
        state.recent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::OperationPolicy;

    #[test]
    fn test_undebounced_operation_never_defers() {
        let debouncer = Debouncer::<u32>::new(None);
        let now = Instant::now();

        debouncer.record_attempt("getDoctor", now);
        assert!(!debouncer.should_defer("getDoctor", now));
        assert_eq!(debouncer.remaining("getDoctor", now), None);
    }

    #[test]
    fn test_defers_within_interval() {
        let debouncer = Debouncer::<u32>::new(None).with_interval("searchDoctors", Duration::from_millis(300));
        let t0 = Instant::now();

        assert!(!debouncer.should_defer("searchDoctors", t0));
        debouncer.record_attempt("searchDoctors", t0);

        let t100 = t0 + Duration::from_millis(100);
        assert!(debouncer.should_defer("searchDoctors", t100));
        assert_eq!(
            debouncer.remaining("searchDoctors", t100),
            Some(Duration::from_millis(200))
        );

        let t500 = t0 + Duration::from_millis(500);
        assert!(!debouncer.should_defer("searchDoctors", t500));
        assert!(!debouncer.should_defer("otherOperation", t100));
    }

    #[test]
    fn test_recent_results_follow_interval() {
        let debouncer = Debouncer::new(Some(Duration::from_millis(300)));
        let key = CacheKey::from("searchDoctors:public:abc");
        let t0 = Instant::now();

        debouncer.remember(&key, "searchDoctors", &Category::Listing, 42u32, t0);
        assert_eq!(debouncer.recent(&key, t0 + Duration::from_millis(100)), Some(42));
        assert_eq!(debouncer.recent(&key, t0 + Duration::from_millis(400)), None);
    }

    #[test]
    fn test_forget_by_target() {
        let debouncer = Debouncer::new(Some(Duration::from_secs(1)));
        let a = CacheKey::from("searchDoctors:public:a");
        let b = CacheKey::from("getInbox:u-1:b");
        let now = Instant::now();

        debouncer.remember(&a, "searchDoctors", &Category::Listing, 1u32, now);
        debouncer.remember(&b, "getInbox", &Category::Message, 2u32, now);

        assert_eq!(debouncer.forget(&InvalidationTarget::from(Category::Listing)), 1);
        assert_eq!(debouncer.recent(&a, now), None);
        assert_eq!(debouncer.recent(&b, now), Some(2));
    }

    #[test]
    fn test_from_config_reads_operation_policies() {
        let config = CacheConfig::builder()
            .operation(
                "searchDoctors",
                OperationPolicy::public(Category::Listing).debounced(Duration::from_millis(250)),
            )
            .build();
        let debouncer = Debouncer::<u32>::from_config(&config);

        assert_eq!(
            debouncer.interval_for("searchDoctors"),
            Some(Duration::from_millis(250))
        );
        assert_eq!(debouncer.interval_for("getDoctor"), None);
    }
}
