//! In-process cache tier with priority-ordered eviction
//!
//! Every operation is synchronous: the map sits behind a `std::sync::Mutex`
//! whose critical sections never await. Capacity is enforced inside `set`.
//! A pruning pass drops expired entries first, then evicts by ascending
//! priority and soonest expiry until the tier is back under the configured
//! fraction of its ceilings. Keys the [`EvictionGuard`] reports as protected
//! (those with a call in flight) are never evicted.

use crate::cache::{
    config::EphemeralConfig,
    entry::CacheEntry,
    invalidation::{InvalidationEvent, InvalidationReason, InvalidationTarget},
    tier::CacheTier,
    types::{CacheKey, CacheValue, Category, Priority, TierKind, TierStats},
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decides which keys must survive eviction
pub trait EvictionGuard: Send + Sync {
    fn is_protected(&self, key: &CacheKey) -> bool;
}

/// In-process cache tier
pub struct EphemeralCache<V> {
    config: EphemeralConfig,
    store: Mutex<EphemeralStore<V>>,
    guard: Option<Arc<dyn EvictionGuard>>,
}

/// Internal cache storage
struct EphemeralStore<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    current_size_bytes: usize,
    stats: TierStats,
}

impl<V> EphemeralStore<V> {
    fn remove_entry(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.current_size_bytes = self.current_size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Eviction candidates, first victim first
    fn victims(&self, guard: Option<&dyn EvictionGuard>, exempt: Option<&CacheKey>) -> Vec<CacheKey> {
        let mut candidates: Vec<(Priority, DateTime<Utc>, &CacheKey)> = self
            .entries
            .iter()
            .filter(|(key, _)| Some(*key) != exempt)
            .filter(|(key, _)| !guard.map_or(false, |g| g.is_protected(key)))
            .map(|(key, entry)| (entry.priority, entry.expires_at, key))
            .collect();

        candidates.sort();
        candidates.into_iter().map(|(_, _, key)| key.clone()).collect()
    }
}

impl<V: CacheValue> EphemeralCache<V> {
    /// Create a tier with no eviction guard
    pub fn new(config: EphemeralConfig) -> Self {
        info!(
            "Initializing ephemeral cache (max_entries: {}, max_size_bytes: {})",
            config.max_entries, config.max_size_bytes
        );

        Self {
            config,
            store: Mutex::new(EphemeralStore {
                entries: HashMap::new(),
                current_size_bytes: 0,
                stats: TierStats::default(),
            }),
            guard: None,
        }
    }

    /// Create a tier whose eviction consults `guard`
    pub fn with_eviction_guard(config: EphemeralConfig, guard: Arc<dyn EvictionGuard>) -> Self {
        let mut cache = Self::new(config);
        cache.guard = Some(guard);
        cache
    }

    fn lock(&self) -> MutexGuard<'_, EphemeralStore<V>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a live value, dropping it first if it has expired
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Get a live entry with its metadata
    pub fn get_entry(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let mut store = self.lock();

        let expired = store.entries.get(key)?.is_expired();
        if expired {
            debug!("Ephemeral entry expired: {}", key);
            store.remove_entry(key);
            store.stats.expirations += 1;
            return None;
        }

        debug!("Ephemeral hit: {}", key);
        store.entries.get(key).cloned()
    }

    /// Check if a key is present (without expiring it)
    pub fn contains_key(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Store `value` fresh for `ttl`
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration, category: Category, priority: Priority) {
        self.set_entry(key, CacheEntry::new(value, ttl, category, priority));
    }

    /// Store a prepared entry, pruning if a ceiling is exceeded
    pub fn set_entry(&self, key: CacheKey, entry: CacheEntry<V>) {
        if entry.size_bytes > self.config.max_size_bytes {
            warn!(
                "Entry {} ({} bytes) exceeds ephemeral capacity of {} bytes, not cached",
                key, entry.size_bytes, self.config.max_size_bytes
            );
            let mut store = self.lock();
            store.stats.rejections += 1;
            // An older copy must not outlive the value that replaced it
            if store.remove_entry(&key).is_some() {
                debug!("Dropped superseded ephemeral entry: {}", key);
            }
            return;
        }

        let mut store = self.lock();

        if store.remove_entry(&key).is_some() {
            debug!("Updating existing ephemeral entry: {}", key);
        } else {
            debug!("Inserting new ephemeral entry: {}", key);
        }

        store.current_size_bytes += entry.size_bytes;
        store.entries.insert(key.clone(), entry);

        if self.over_ceiling(&store) {
            self.prune(&mut store, &key);
        }
    }

    /// Evict up to `count` entries in eviction order, returning the evicted keys
    pub fn evict(&self, count: usize) -> Vec<CacheKey> {
        let mut store = self.lock();
        let victims: Vec<CacheKey> = store
            .victims(self.guard.as_deref(), None)
            .into_iter()
            .take(count)
            .collect();

        for key in &victims {
            store.remove_entry(key);
            store.stats.evictions += 1;
        }

        debug!("Evicted {} ephemeral entries on request", victims.len());
        victims
    }

    /// Remove a specific entry
    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        let mut store = self.lock();
        let entry = store.remove_entry(key)?;
        store.stats.invalidations += 1;
        debug!("Removed ephemeral entry: {}", key);
        Some(entry.value)
    }

    /// Remove every entry matching `target`
    pub fn invalidate(&self, target: &InvalidationTarget) -> InvalidationEvent {
        let mut store = self.lock();

        let keys: Vec<CacheKey> = store
            .entries
            .iter()
            .filter(|(key, entry)| target.matches(key, &entry.category))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            store.remove_entry(key);
        }
        store.stats.invalidations += keys.len() as u64;

        if !keys.is_empty() {
            debug!("Invalidated {} ephemeral entries ({:?})", keys.len(), target);
        }
        InvalidationEvent::new(InvalidationReason::Manual, TierKind::Ephemeral, keys)
    }

    /// Remove all entries whose stale window has elapsed
    pub fn purge_expired(&self) -> InvalidationEvent {
        let mut store = self.lock();
        let keys = store.expired_keys(Utc::now());

        for key in &keys {
            store.remove_entry(key);
        }
        store.stats.expirations += keys.len() as u64;

        if !keys.is_empty() {
            debug!("Purged {} expired ephemeral entries", keys.len());
        }
        InvalidationEvent::new(InvalidationReason::Expired, TierKind::Ephemeral, keys)
    }

    /// Clear all entries
    pub fn clear(&self) {
        let mut store = self.lock();
        let count = store.entries.len();
        store.entries.clear();
        store.current_size_bytes = 0;
        store.stats.invalidations += count as u64;
        info!("Cleared {} entries from ephemeral cache", count);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.lock().current_size_bytes
    }

    pub fn stats(&self) -> TierStats {
        let store = self.lock();
        TierStats {
            entries: store.entries.len(),
            size_bytes: store.current_size_bytes,
            ..store.stats.clone()
        }
    }

    fn over_ceiling(&self, store: &EphemeralStore<V>) -> bool {
        store.entries.len() > self.config.max_entries
            || store.current_size_bytes > self.config.max_size_bytes
    }

    /// Shrink to the prune target, never touching `just_written`
    fn prune(&self, store: &mut EphemeralStore<V>, just_written: &CacheKey) {
        let expired = store.expired_keys(Utc::now());
        for key in &expired {
            store.remove_entry(key);
        }
        store.stats.expirations += expired.len() as u64;

        if !self.over_ceiling(store) {
            return;
        }

        let ratio = self.config.prune_target_ratio;
        let target_entries = (self.config.max_entries as f64 * ratio) as usize;
        let target_bytes = (self.config.max_size_bytes as f64 * ratio) as usize;

        let mut evicted = 0u64;
        for key in store.victims(self.guard.as_deref(), Some(just_written)) {
            if store.entries.len() <= target_entries && store.current_size_bytes <= target_bytes {
                break;
            }
            store.remove_entry(&key);
            evicted += 1;
        }
        store.stats.evictions += evicted;

        if self.over_ceiling(store) {
            warn!(
                "Ephemeral cache still over capacity after evicting {} entries ({} entries, {} bytes); remaining entries are protected",
                evicted,
                store.entries.len(),
                store.current_size_bytes
            );
        } else {
            debug!(
                "Pruned ephemeral cache: evicted {}, now {} entries",
                evicted,
                store.entries.len()
            );
        }
    }
}

#[async_trait]
impl<V: CacheValue> CacheTier<V> for EphemeralCache<V> {
    fn kind(&self) -> TierKind {
        TierKind::Ephemeral
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>> {
        Ok(self.get_entry(key))
    }

    async fn set(&self, key: &CacheKey, entry: CacheEntry<V>) -> Result<()> {
        self.set_entry(key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(EphemeralCache::remove(self, key).is_some())
    }

    async fn invalidate(&self, target: &InvalidationTarget) -> Result<InvalidationEvent> {
        Ok(EphemeralCache::invalidate(self, target))
    }

    async fn clear(&self) -> Result<()> {
        EphemeralCache::clear(self);
        Ok(())
    }

    async fn stats(&self) -> TierStats {
        EphemeralCache::stats(self)
    }
}
