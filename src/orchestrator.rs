//! Public entry point composing keys, tiers, coalescing, debouncing and
//! stale-while-revalidate into a single `fetch`
//!
//! A fetch walks a fixed sequence of states:
//!
//! ```text
//! Idle -> KeyBuilt -> FreshHit
//!                  -> StaleHit (+ background Refresh)
//!                  -> Coalesced (awaits the in-flight call)
//!                  -> Debounced (recent result, or wait out the interval)
//!                  -> Miss -> InFlight -> Settled(Success | Failure)
//! ```
//!
//! Remote calls run on their own tokio task. A caller that stops awaiting never
//! cancels the call, and the result is written to every tier before the pending
//! registration is released and the shared future resolves.

use crate::cache::{
    coalescer::{Coalescer, RemoteResult, SharedOutcome},
    config::CacheConfig,
    debounce::Debouncer,
    durable::DurableStore,
    entry::CacheEntry,
    ephemeral::{EphemeralCache, EvictionGuard},
    invalidation::{InvalidationEvent, InvalidationTarget},
    key::CacheKeyBuilder,
    persistent::PersistentCache,
    revalidate::{Freshness, StaleRevalidator},
    tier::CacheTier,
    types::{CacheKey, CacheStats, CacheValue, Category, Priority, TierKind},
};
use crate::error::{RemoteError, Result};
use crate::registry::RemoteInvoker;
use chrono::Utc;
use futures::future::FutureExt;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Fresh lifetime of the stored result instead of the category default
    pub ttl: Option<Duration>,

    /// Eviction priority instead of the category default
    pub priority: Option<Priority>,

    /// Skip every cache tier and the debounce window
    pub force_refresh: bool,

    /// Category instead of the operation's configured one
    pub category: Option<Category>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
}

/// Progress of a single fetch, traced at debug level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    KeyBuilt,
    FreshHit,
    StaleHit,
    Refresh,
    Coalesced,
    Debounced,
    Miss,
    InFlight,
    SettledSuccess,
    SettledFailure,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchState::Idle => "idle",
            FetchState::KeyBuilt => "key_built",
            FetchState::FreshHit => "fresh_hit",
            FetchState::StaleHit => "stale_hit",
            FetchState::Refresh => "refresh",
            FetchState::Coalesced => "coalesced",
            FetchState::Debounced => "debounced",
            FetchState::Miss => "miss",
            FetchState::InFlight => "in_flight",
            FetchState::SettledSuccess => "settled(success)",
            FetchState::SettledFailure => "settled(failure)",
        };
        f.write_str(name)
    }
}

fn trace_state(key: &CacheKey, state: FetchState) {
    debug!("fetch {} -> {}", key, state);
}

/// Everything a remote call needs once it leaves the caller
#[derive(Debug, Clone)]
struct RemoteCall {
    operation: String,
    args: Value,
    identity: Option<String>,
    key: CacheKey,
    category: Category,
    ttl: Option<Duration>,
    priority: Option<Priority>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    coalesced: AtomicU64,
    debounced: AtomicU64,
    remote_calls: AtomicU64,
    remote_failures: AtomicU64,
    refreshes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Inner<V: CacheValue> {
    config: CacheConfig,
    keys: CacheKeyBuilder,
    ephemeral: Arc<EphemeralCache<V>>,
    /// Cheapest first; the ephemeral tier is always `tiers[0]`
    tiers: Vec<Arc<dyn CacheTier<V>>>,
    coalescer: Arc<Coalescer<V>>,
    debouncer: Debouncer<V>,
    revalidator: StaleRevalidator,
    invoker: Arc<dyn RemoteInvoker<V>>,
    counters: Counters,
}

/// Cache-fronted access to a remote collaborator
///
/// Cloning is cheap; clones share every tier and counter.
pub struct Orchestrator<V: CacheValue = Value> {
    inner: Arc<Inner<V>>,
}

impl<V: CacheValue> Clone for Orchestrator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> Orchestrator<V> {
    /// Build an orchestrator over `invoker`
    ///
    /// With a durable `store` a persistent tier is opened behind the ephemeral
    /// one. If that fails the orchestrator logs it and runs on the ephemeral tier
    /// alone. Only an invalid configuration is an error.
    pub async fn init(
        config: CacheConfig,
        invoker: Arc<dyn RemoteInvoker<V>>,
        store: Option<Arc<dyn DurableStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let coalescer = Arc::new(Coalescer::new(config.pending_timeout));
        let guard: Arc<dyn EvictionGuard> = coalescer.clone();
        let ephemeral = Arc::new(EphemeralCache::with_eviction_guard(
            config.ephemeral.clone(),
            guard,
        ));

        let mut tiers: Vec<Arc<dyn CacheTier<V>>> = vec![ephemeral.clone() as Arc<dyn CacheTier<V>>];

        if let Some(store) = store {
            match PersistentCache::open(config.persistent.clone(), store).await {
                Ok(persistent) => tiers.push(Arc::new(persistent)),
                Err(e) => warn!("Persistent tier unavailable, continuing in memory only: {}", e),
            }
        }

        info!(
            "Orchestrator ready ({} tiers, {} configured operations)",
            tiers.len(),
            config.operations.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                keys: CacheKeyBuilder::new(),
                debouncer: Debouncer::from_config(&config),
                revalidator: StaleRevalidator::new(config.max_stale_tolerance),
                config,
                ephemeral,
                tiers,
                coalescer,
                invoker,
                counters: Counters::default(),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Whether a persistent tier is active
    pub fn is_persistent(&self) -> bool {
        self.inner
            .tiers
            .iter()
            .any(|tier| tier.kind() == TierKind::Persistent)
    }

    /// Key `fetch` would use for this call
    pub fn key_for(&self, operation: &str, args: &Value, identity: Option<&str>) -> CacheKey {
        let policy = self.inner.config.operation_policy(operation);
        let scope = if policy.identity_scoped { identity } else { None };
        self.inner.keys.build(operation, scope, args)
    }

    /// Fetch the result of `operation(args)` for `identity`
    ///
    /// Returns a cached value when one is fresh or within its stale window,
    /// joins an identical call already in flight, and otherwise invokes the
    /// remote. The only error is the one the remote produced.
    pub async fn fetch(
        &self,
        operation: &str,
        args: &Value,
        identity: Option<&str>,
        options: FetchOptions,
    ) -> RemoteResult<V> {
        debug!("fetch {} -> {}", operation, FetchState::Idle);
        let inner = &self.inner;
        let policy = inner.config.operation_policy(operation);
        let key = self.key_for(operation, args, identity);
        trace_state(&key, FetchState::KeyBuilt);

        let call = RemoteCall {
            operation: operation.to_string(),
            args: args.clone(),
            identity: identity.map(str::to_owned),
            key: key.clone(),
            category: options.category.clone().unwrap_or(policy.category),
            ttl: options.ttl,
            priority: options.priority,
        };

        let mut waited = false;
        loop {
            if !options.force_refresh {
                if let Some(value) = self.read_through(&call).await {
                    Counters::bump(&inner.counters.hits);
                    return Ok(value);
                }
            }

            if let Some(pending) = inner.coalescer.lookup(&key) {
                Counters::bump(&inner.counters.misses);
                Counters::bump(&inner.counters.coalesced);
                trace_state(&key, FetchState::Coalesced);
                return self.settle(&call, pending.future, options.force_refresh).await;
            }

            if options.force_refresh || waited {
                break;
            }

            let now = Instant::now();
            let Some(wait) = inner.debouncer.remaining(operation, now) else {
                break;
            };

            trace_state(&key, FetchState::Debounced);
            if let Some(value) = inner.debouncer.recent(&key, now) {
                Counters::bump(&inner.counters.misses);
                Counters::bump(&inner.counters.debounced);
                return Ok(value);
            }

            debug!("Deferring {} for {:?}", key, wait);
            tokio::time::sleep(wait).await;
            waited = true;
        }

        Counters::bump(&inner.counters.misses);
        trace_state(&key, FetchState::Miss);

        let (pending, started) = inner
            .coalescer
            .lookup_or_register(&key, |signature| self.start_call(call.clone(), signature));

        if !started {
            Counters::bump(&inner.counters.coalesced);
            trace_state(&key, FetchState::Coalesced);
        }
        self.settle(&call, pending.future, options.force_refresh).await
    }

    /// Probe the tiers in order, promoting hits and refreshing stale ones
    async fn read_through(&self, call: &RemoteCall) -> Option<V> {
        let inner = &self.inner;
        let now = Utc::now();

        for (depth, tier) in inner.tiers.iter().enumerate() {
            let entry = match tier.get(&call.key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("{} tier read failed for {}: {}", tier.kind(), call.key, e);
                    continue;
                }
            };

            let freshness = inner.revalidator.classify(&entry, now);
            if freshness == Freshness::Expired {
                continue;
            }

            for upper in &inner.tiers[..depth] {
                if let Err(e) = upper.set(&call.key, entry.clone()).await {
                    warn!("Failed to promote {} into {} tier: {}", call.key, upper.kind(), e);
                }
            }

            if freshness == Freshness::Stale {
                Counters::bump(&inner.counters.stale_hits);
                trace_state(&call.key, FetchState::StaleHit);
                self.refresh_in_background(call);
            } else {
                trace_state(&call.key, FetchState::FreshHit);
            }
            return Some(entry.value);
        }
        None
    }

    /// Start at most one refresh for a stale key
    fn refresh_in_background(&self, call: &RemoteCall) {
        let inner = &self.inner;
        if inner.debouncer.should_defer(&call.operation, Instant::now()) {
            debug!("Refresh of {} deferred by debounce window", call.key);
            return;
        }

        let (_, started) = inner
            .coalescer
            .lookup_or_register(&call.key, |signature| self.start_call(call.clone(), signature));

        if started {
            Counters::bump(&inner.counters.refreshes);
            trace_state(&call.key, FetchState::Refresh);
        }
    }

    /// Spawn the remote call and wrap its handle in a shareable future
    fn start_call(&self, call: RemoteCall, signature: Uuid) -> SharedOutcome<V> {
        let inner = Arc::clone(&self.inner);
        let operation = call.operation.clone();

        inner.debouncer.record_attempt(&operation, Instant::now());
        let handle = tokio::spawn(async move { inner.run_call(call, signature).await });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(RemoteError::Interrupted {
                    operation,
                    message: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Await a shared outcome, falling back to a still-tolerable cached value
    async fn settle(&self, call: &RemoteCall, future: SharedOutcome<V>, bypassed: bool) -> RemoteResult<V> {
        match future.await {
            Ok(value) => Ok(value),
            Err(e) if bypassed && self.inner.config.serve_stale_on_error => {
                match self.cached_within_tolerance(call).await {
                    Some(value) => {
                        warn!("Serving cached {} after remote failure: {}", call.key, e);
                        Ok(value)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn cached_within_tolerance(&self, call: &RemoteCall) -> Option<V> {
        let now = Utc::now();
        for tier in &self.inner.tiers {
            if let Ok(Some(entry)) = tier.get(&call.key).await {
                if self.inner.revalidator.classify(&entry, now).is_usable() {
                    return Some(entry.value);
                }
            }
        }
        None
    }

    /// Remove matching entries from every tier
    pub async fn invalidate(&self, target: impl Into<InvalidationTarget>) -> Vec<InvalidationEvent> {
        let target = target.into();
        let mut events = Vec::with_capacity(self.inner.tiers.len());

        for tier in &self.inner.tiers {
            match tier.invalidate(&target).await {
                Ok(event) => events.push(event),
                Err(e) => warn!("{} tier invalidation failed: {}", tier.kind(), e),
            }
        }
        self.inner.debouncer.forget(&target);

        let removed: usize = events.iter().map(InvalidationEvent::len).sum();
        info!("Invalidated {:?}: {} entries removed", target, removed);
        events
    }

    /// Empty every tier; calls in flight still complete and write back
    pub async fn clear(&self) {
        for tier in &self.inner.tiers {
            if let Err(e) = tier.clear().await {
                warn!("Failed to clear {} tier: {}", tier.kind(), e);
            }
        }
        self.inner.debouncer.clear();
    }

    /// Snapshot of engine counters
    pub async fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        let mut stats = CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            stale_hits: counters.stale_hits.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            debounced: counters.debounced.load(Ordering::Relaxed),
            remote_calls: counters.remote_calls.load(Ordering::Relaxed),
            remote_failures: counters.remote_failures.load(Ordering::Relaxed),
            refreshes: counters.refreshes.load(Ordering::Relaxed),
            pending_count: self.inner.coalescer.len(),
            ..Default::default()
        };

        for tier in &self.inner.tiers {
            let tier_stats = tier.stats().await;
            stats.evictions += tier_stats.evictions;
            match tier.kind() {
                TierKind::Ephemeral => stats.ephemeral_entries += tier_stats.entries,
                TierKind::Persistent => stats.persistent_entry_count += tier_stats.entries,
            }
        }
        stats
    }

    /// One maintenance pass: purge expired in-memory entries and stale
    /// pending operations
    pub fn maintain(&self) -> InvalidationEvent {
        self.inner.maintain()
    }

    /// Run [`Orchestrator::maintain`] every `cleanup_interval` on a background task
    ///
    /// Returns `None` when auto cleanup is disabled. The task ends once every
    /// handle to the orchestrator has been dropped.
    pub fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.enable_auto_cleanup {
            return None;
        }

        let interval = self.inner.config.cleanup_interval;
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        info!("Starting cache maintenance task (interval: {:?})", interval);

        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(inner) = weak.upgrade() else {
                    debug!("Orchestrator dropped, stopping maintenance");
                    break;
                };
                let event = inner.maintain();
                if !event.is_empty() {
                    debug!("Maintenance: {} entries purged", event.len());
                }
            }
        }))
    }
}

/// Releases a remote call's pending registration when the call ends,
/// including when the invoker panics and the task unwinds
struct Registration<'a, V: CacheValue> {
    inner: &'a Inner<V>,
    key: &'a CacheKey,
    signature: Uuid,
    settled: bool,
}

impl<V: CacheValue> Drop for Registration<'_, V> {
    fn drop(&mut self) {
        if !self.settled {
            Counters::bump(&self.inner.counters.remote_failures);
            warn!("Remote call for {} ended without a result", self.key);
            trace_state(self.key, FetchState::SettledFailure);
        }
        self.inner.coalescer.release_matching(self.key, self.signature);
    }
}

impl<V: CacheValue> Inner<V> {
    async fn run_call(&self, call: RemoteCall, signature: Uuid) -> RemoteResult<V> {
        Counters::bump(&self.counters.remote_calls);
        trace_state(&call.key, FetchState::InFlight);
        let mut registration = Registration {
            inner: self,
            key: &call.key,
            signature,
            settled: false,
        };

        let outcome = self
            .invoker
            .invoke(&call.operation, &call.args, call.identity.as_deref())
            .await;

        match &outcome {
            Ok(value) => {
                self.write_back(&call, value).await;
                self.debouncer
                    .remember(&call.key, &call.operation, &call.category, value.clone(), Instant::now());
                trace_state(&call.key, FetchState::SettledSuccess);
            }
            Err(e) => {
                Counters::bump(&self.counters.remote_failures);
                warn!("Remote call {} failed: {}", call.operation, e);
                trace_state(&call.key, FetchState::SettledFailure);
            }
        }

        registration.settled = true;
        drop(registration);
        outcome
    }

    async fn write_back(&self, call: &RemoteCall, value: &V) {
        let policy = self.config.category_policy(&call.category);
        let ttl = call
            .ttl
            .unwrap_or_else(|| self.config.ttl_with_jitter(policy.ttl));
        let priority = call.priority.unwrap_or(policy.priority);

        let entry = CacheEntry::new(value.clone(), ttl, call.category.clone(), priority)
            .with_stale_tolerance(policy.stale_tolerance);

        for tier in &self.tiers {
            if let Err(e) = tier.set(&call.key, entry.clone()).await {
                warn!("Failed to write {} to {} tier: {}", call.key, tier.kind(), e);
            }
        }
    }

    fn maintain(&self) -> InvalidationEvent {
        let released = self.coalescer.release_stale();
        let event = self.ephemeral.purge_expired();

        if !released.is_empty() {
            info!("Maintenance released {} stale pending operations", released.len());
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::{CategoryPolicy, OperationPolicy};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Counts invocations and answers with the call number
    struct CountingInvoker {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingInvoker {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(10),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteInvoker<Value> for CountingInvoker {
        async fn invoke(&self, operation: &str, args: &Value, _identity: Option<&str>) -> RemoteResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(RemoteError::failed(operation, "backend down"));
            }
            Ok(json!({ "call": n, "args": args }))
        }
    }

    fn config() -> CacheConfig {
        CacheConfig::builder()
            .ttl_jitter(0.0)
            .enable_auto_cleanup(false)
            .category(
                Category::Listing,
                CategoryPolicy::new(Duration::from_secs(60), Duration::from_secs(30), Priority::Normal),
            )
            .operation("findDoctors", OperationPolicy::public(Category::Listing))
            .build()
    }

    async fn orchestrator(invoker: Arc<CountingInvoker>) -> Orchestrator {
        Orchestrator::init(config(), invoker, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let invoker = CountingInvoker::new(Duration::from_millis(5));
        let cache = orchestrator(invoker.clone()).await;
        let args = json!({"specialty": "cardiology"});

        let first = cache.fetch("findDoctors", &args, None, FetchOptions::new()).await.unwrap();
        let second = cache.fetch("findDoctors", &args, None, FetchOptions::new()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(invoker.calls(), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.remote_calls, 1);
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.ephemeral_entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_call() {
        let invoker = CountingInvoker::new(Duration::from_millis(50));
        let cache = orchestrator(invoker.clone()).await;
        let args = json!({"specialty": "cardiology"});

        let (a, b, c) = tokio::join!(
            cache.fetch("findDoctors", &args, None, FetchOptions::new()),
            cache.fetch("findDoctors", &args, None, FetchOptions::new()),
            cache.fetch("findDoctors", &args, None, FetchOptions::new()),
        );

        assert_eq!(invoker.calls(), 1);
        assert_eq!(a.unwrap(), b.clone().unwrap());
        assert_eq!(b.unwrap(), c.unwrap());
        assert_eq!(cache.stats().await.coalesced, 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let invoker = CountingInvoker::failing();
        let cache = orchestrator(invoker.clone()).await;
        let args = json!({"specialty": "cardiology"});

        let err = cache
            .fetch("findDoctors", &args, None, FetchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::failed("findDoctors", "backend down"));

        let stats = cache.stats().await;
        assert_eq!(stats.ephemeral_entries, 0);
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.remote_failures, 1);

        cache
            .fetch("findDoctors", &args, None, FetchOptions::new())
            .await
            .unwrap_err();
        assert_eq!(invoker.calls(), 2);
    }

    #[tokio::test]
    async fn test_identity_scoped_keys_do_not_collide() {
        let invoker = CountingInvoker::new(Duration::from_millis(1));
        let cache = orchestrator(invoker.clone()).await;
        let args = json!({});

        cache.fetch("getProfile", &args, Some("alice"), FetchOptions::new()).await.unwrap();
        cache.fetch("getProfile", &args, Some("bob"), FetchOptions::new()).await.unwrap();
        assert_eq!(invoker.calls(), 2);

        // Public operations ignore identity
        let a = cache.key_for("findDoctors", &args, Some("alice"));
        let b = cache.key_for("findDoctors", &args, Some("bob"));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_tiers() {
        let invoker = CountingInvoker::new(Duration::from_millis(1));
        let cache = orchestrator(invoker.clone()).await;
        let args = json!({"specialty": "dermatology"});

        cache.fetch("findDoctors", &args, None, FetchOptions::new()).await.unwrap();
        let refreshed = cache
            .fetch("findDoctors", &args, None, FetchOptions::new().force_refresh())
            .await
            .unwrap();

        assert_eq!(invoker.calls(), 2);
        assert_eq!(refreshed["call"], json!(2));
        let cached = cache.fetch("findDoctors", &args, None, FetchOptions::new()).await.unwrap();
        assert_eq!(cached["call"], json!(2));
    }

    #[tokio::test]
    async fn test_caller_drop_does_not_cancel_call() {
        let invoker = CountingInvoker::new(Duration::from_millis(50));
        let cache = orchestrator(invoker.clone()).await;
        let args = json!({"specialty": "neurology"});

        let dropped = tokio::time::timeout(
            Duration::from_millis(10),
            cache.fetch("findDoctors", &args, None, FetchOptions::new()),
        )
        .await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let value = cache.fetch("findDoctors", &args, None, FetchOptions::new()).await.unwrap();
        assert_eq!(value["call"], json!(1));
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_category_prefix() {
        let invoker = CountingInvoker::new(Duration::from_millis(1));
        let cache = orchestrator(invoker.clone()).await;

        cache.fetch("findDoctors", &json!({"p": 1}), None, FetchOptions::new()).await.unwrap();
        cache.fetch("findDoctors", &json!({"p": 2}), None, FetchOptions::new()).await.unwrap();

        let events = cache.invalidate("listing").await;
        assert_eq!(events.iter().map(InvalidationEvent::len).sum::<usize>(), 2);
        assert_eq!(cache.stats().await.ephemeral_entries, 0);

        cache.fetch("findDoctors", &json!({"p": 1}), None, FetchOptions::new()).await.unwrap();
        assert_eq!(invoker.calls(), 3);
    }

    #[tokio::test]
    async fn test_spawn_maintenance_respects_config() {
        let invoker = CountingInvoker::new(Duration::from_millis(1));
        let cache = orchestrator(invoker).await;
        assert!(cache.spawn_maintenance().is_none());
    }

    /// Panics on its first call, then answers normally
    struct PanicOnceInvoker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteInvoker<Value> for PanicOnceInvoker {
        async fn invoke(&self, _operation: &str, _args: &Value, _identity: Option<&str>) -> RemoteResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(5)).await;
            if n == 1 {
                panic!("handler bug");
            }
            Ok(json!({ "call": n }))
        }
    }

    #[tokio::test]
    async fn test_panicking_invoker_releases_pending_call() {
        let invoker = Arc::new(PanicOnceInvoker {
            calls: AtomicUsize::new(0),
        });
        let cache: Orchestrator = Orchestrator::init(config(), invoker.clone(), None).await.unwrap();
        let args = json!({"specialty": "cardiology"});

        let first = cache.fetch("findDoctors", &args, None, FetchOptions::new()).await;
        assert!(matches!(first, Err(RemoteError::Interrupted { .. })));
        assert_eq!(cache.stats().await.pending_count, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = cache.fetch("findDoctors", &args, None, FetchOptions::new()).await.unwrap();
        assert_eq!(second, json!({ "call": 2 }));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);

        let stats = cache.stats().await;
        assert_eq!(stats.remote_calls, 2);
        assert_eq!(stats.remote_failures, 1);
        assert_eq!(stats.pending_count, 0);
    }

    #[test]
    fn test_fetch_state_display() {
        assert_eq!(FetchState::SettledFailure.to_string(), "settled(failure)");
        assert_eq!(FetchState::Idle.to_string(), "idle");
    }
}
