//! Durable cache tier
//!
//! Entries are stored as JSON envelopes under `{namespace}{category}:{key}` in a
//! [`DurableStore`]. A version marker guards the whole namespace: when it does
//! not match the configured schema version the namespace is purged and the
//! marker rewritten, which is a cold start rather than an error. An in-memory
//! index (rebuilt on [`PersistentCache::open`]) tracks creation time, expiry and
//! size of every item so lookups of absent keys, pruning and statistics never
//! touch the substrate.

use crate::cache::{
    config::PersistentConfig,
    durable::DurableStore,
    entry::CacheEntry,
    invalidation::{InvalidationEvent, InvalidationReason, InvalidationTarget},
    tier::CacheTier,
    types::{CacheKey, CacheValue, Category, Priority, TierKind, TierStats},
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Stored form of an entry
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<D> {
    data: D,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    fresh_until: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expires_at: DateTime<Utc>,
    category: Category,
    #[serde(default)]
    priority: Priority,
    schema_version: String,
}

/// Envelope metadata, decoded without the payload type
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expires_at: DateTime<Utc>,
    category: Category,
    schema_version: String,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    storage_key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    category: Category,
    size_bytes: usize,
}

/// Persistent cache tier over a durable substrate
pub struct PersistentCache {
    config: PersistentConfig,
    store: Arc<dyn DurableStore>,
    index: Mutex<HashMap<CacheKey, IndexEntry>>,
    stats: Mutex<TierStats>,
    /// Serializes every mutation of the substrate
    write_lock: tokio::sync::Mutex<()>,
}

impl PersistentCache {
    /// Open the tier: check the version marker, then index what survived
    pub async fn open(config: PersistentConfig, store: Arc<dyn DurableStore>) -> Result<Self> {
        let cache = Self {
            config,
            store,
            index: Mutex::new(HashMap::new()),
            stats: Mutex::new(TierStats::default()),
            write_lock: tokio::sync::Mutex::new(()),
        };

        cache.init().await?;
        Ok(cache)
    }

    /// Re-run the startup checks against the substrate
    pub async fn init(&self) -> Result<Vec<InvalidationEvent>> {
        let _write = self.write_lock.lock().await;
        let mut events = Vec::new();

        match self.check_version().await {
            Ok(()) => {
                events.extend(self.load_index().await?);
            }
            Err(CacheError::VersionMismatch { found, expected }) => {
                info!(
                    "Persistent cache schema changed ({:?} -> {}), purging namespace {}",
                    found, expected, self.config.namespace
                );
                let purged = self.purge_namespace().await?;
                self.store
                    .write(&self.config.version_key(), expected.into_bytes())
                    .await?;
                self.lock_index().clear();

                events.push(
                    InvalidationEvent::new(
                        InvalidationReason::SchemaMismatch { found },
                        TierKind::Persistent,
                        Vec::new(),
                    )
                    .with_context(format!("Purged {} stored items", purged)),
                );
            }
            Err(e) => return Err(e),
        }

        if let Some(event) = self.prune_if_needed().await? {
            events.push(event);
        }

        info!(
            "Persistent cache ready (schema {}, {} entries)",
            self.config.schema_version,
            self.lock_index().len()
        );
        Ok(events)
    }

    fn lock_index(&self) -> MutexGuard<'_, HashMap<CacheKey, IndexEntry>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, TierStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_key(&self, category: &Category, key: &CacheKey) -> String {
        format!("{}{}:{}", self.config.namespace, category, key)
    }

    fn is_namespaced_item(&self, storage_key: &str) -> bool {
        storage_key.starts_with(&self.config.namespace) && storage_key != self.config.version_key()
    }

    async fn check_version(&self) -> Result<()> {
        let expected = &self.config.schema_version;
        let found = self
            .store
            .read(&self.config.version_key())
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        match found {
            Some(ref v) if v == expected => Ok(()),
            found => Err(CacheError::VersionMismatch {
                found,
                expected: expected.clone(),
            }),
        }
    }

    /// Delete every item in the namespace except the marker
    async fn purge_namespace(&self) -> Result<usize> {
        let mut purged = 0;
        for storage_key in self.store.keys().await? {
            if !self.is_namespaced_item(&storage_key) {
                continue;
            }
            match self.store.delete(&storage_key).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to purge {}: {}", storage_key, e),
            }
        }
        Ok(purged)
    }

    /// Rebuild the index, dropping undecodable, foreign-version and expired items
    async fn load_index(&self) -> Result<Vec<InvalidationEvent>> {
        let now = Utc::now();
        let mut index = HashMap::new();
        let mut corrupt = Vec::new();
        let mut expired = Vec::new();

        for storage_key in self.store.keys().await? {
            if !self.is_namespaced_item(&storage_key) {
                continue;
            }

            let bytes = match self.store.read(&storage_key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read {} while indexing: {}", storage_key, e);
                    continue;
                }
            };

            let parsed = serde_json::from_slice::<EnvelopeHeader>(&bytes)
                .ok()
                .filter(|header| header.schema_version == self.config.schema_version)
                .and_then(|header| {
                    let prefix = format!("{}{}:", self.config.namespace, header.category);
                    let key = storage_key.strip_prefix(&prefix)?;
                    Some((CacheKey::from(key), header))
                });

            let Some((key, header)) = parsed else {
                warn!("Dropping undecodable persistent entry {}", storage_key);
                self.delete_quietly(&storage_key).await;
                corrupt.push(CacheKey::from(storage_key));
                continue;
            };

            if header.expires_at < now {
                self.delete_quietly(&storage_key).await;
                expired.push(key);
                continue;
            }

            index.insert(
                key,
                IndexEntry {
                    storage_key,
                    created_at: header.created_at,
                    expires_at: header.expires_at,
                    category: header.category,
                    size_bytes: bytes.len(),
                },
            );
        }

        debug!(
            "Indexed {} persistent entries ({} corrupt, {} expired)",
            index.len(),
            corrupt.len(),
            expired.len()
        );

        *self.lock_index() = index;
        {
            let mut stats = self.lock_stats();
            stats.corrupt += corrupt.len() as u64;
            stats.expirations += expired.len() as u64;
        }

        let mut events = Vec::new();
        if !corrupt.is_empty() {
            events.push(InvalidationEvent::new(
                InvalidationReason::Corrupt,
                TierKind::Persistent,
                corrupt,
            ));
        }
        if !expired.is_empty() {
            events.push(InvalidationEvent::new(
                InvalidationReason::Expired,
                TierKind::Persistent,
                expired,
            ));
        }
        Ok(events)
    }

    /// Drop `key` from the index only while it still describes the record in `meta`
    fn forget_if_current(&self, key: &CacheKey, meta: &IndexEntry) -> bool {
        let mut index = self.lock_index();
        match index.get(key) {
            Some(current)
                if current.storage_key == meta.storage_key && current.created_at == meta.created_at =>
            {
                index.remove(key);
                true
            }
            _ => {
                debug!("Persistent entry {} was rewritten concurrently, keeping it", key);
                false
            }
        }
    }

    async fn delete_quietly(&self, storage_key: &str) {
        if let Err(e) = self.store.delete(storage_key).await {
            warn!("Failed to delete {}: {}", storage_key, e);
        }
    }

    /// Encode an envelope, refusing it if it exceeds the per-item budget
    fn encode_within_capacity<V: CacheValue>(&self, key: &CacheKey, entry: &CacheEntry<V>) -> Result<Vec<u8>> {
        let envelope = Envelope {
            data: &entry.value,
            created_at: entry.created_at,
            fresh_until: entry.fresh_until,
            expires_at: entry.expires_at,
            category: entry.category.clone(),
            priority: entry.priority,
            schema_version: self.config.schema_version.clone(),
        };

        let bytes = serde_json::to_vec(&envelope)?;
        let limit = self.config.max_item_bytes();

        if bytes.len() > limit {
            return Err(CacheError::CapacityRejection {
                key: key.to_string(),
                size_bytes: bytes.len(),
                limit_bytes: limit,
            });
        }
        Ok(bytes)
    }

    /// Remove the oldest items once a storage ceiling is exceeded
    async fn prune_if_needed(&self) -> Result<Option<InvalidationEvent>> {
        let mut by_age: Vec<(DateTime<Utc>, CacheKey, String, usize)> = {
            let index = self.lock_index();
            let total: usize = index.values().map(|e| e.size_bytes).sum();
            if index.len() <= self.config.max_entries && total <= self.config.max_size_bytes {
                return Ok(None);
            }
            index
                .iter()
                .map(|(k, e)| (e.created_at, k.clone(), e.storage_key.clone(), e.size_bytes))
                .collect()
        };
        by_age.sort();

        let count = by_age.len();
        let mut remaining_bytes: usize = by_age.iter().map(|(_, _, _, size)| size).sum();
        let quota = ((count as f64) * self.config.prune_fraction).ceil() as usize;

        let mut removed = Vec::new();
        for (i, (_, key, storage_key, size)) in by_age.into_iter().enumerate() {
            if i >= quota && remaining_bytes <= self.config.max_size_bytes {
                break;
            }
            self.delete_quietly(&storage_key).await;
            self.lock_index().remove(&key);
            remaining_bytes = remaining_bytes.saturating_sub(size);
            removed.push(key);
        }

        self.lock_stats().evictions += removed.len() as u64;
        info!(
            "Pruned {} of {} persistent entries (oldest first)",
            removed.len(),
            count
        );

        Ok(Some(InvalidationEvent::new(
            InvalidationReason::Pruned,
            TierKind::Persistent,
            removed,
        )))
    }

    /// Read an entry, treating undecodable items as a miss and deleting them
    pub async fn get<V: CacheValue>(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>> {
        let Some(meta) = self.lock_index().get(key).cloned() else {
            return Ok(None);
        };

        if meta.expires_at < Utc::now() {
            debug!("Persistent entry expired: {}", key);
            let _write = self.write_lock.lock().await;
            if self.forget_if_current(key, &meta) {
                self.delete_quietly(&meta.storage_key).await;
                self.lock_stats().expirations += 1;
            }
            return Ok(None);
        }

        let Some(bytes) = self.store.read(&meta.storage_key).await? else {
            self.forget_if_current(key, &meta);
            return Ok(None);
        };

        match serde_json::from_slice::<Envelope<V>>(&bytes) {
            Ok(envelope) if envelope.schema_version == self.config.schema_version => {
                debug!("Persistent hit: {}", key);
                Ok(Some(CacheEntry {
                    value: envelope.data,
                    created_at: envelope.created_at,
                    fresh_until: envelope.fresh_until,
                    expires_at: envelope.expires_at,
                    category: envelope.category,
                    priority: envelope.priority,
                    size_bytes: bytes.len(),
                }))
            }
            outcome => {
                let reason = match outcome {
                    Err(e) => CacheError::from(e).to_string(),
                    Ok(envelope) => format!("schema version {}", envelope.schema_version),
                };
                warn!("Dropping unreadable persistent entry {}: {}", key, reason);
                let _write = self.write_lock.lock().await;
                if self.forget_if_current(key, &meta) {
                    self.delete_quietly(&meta.storage_key).await;
                    self.lock_stats().corrupt += 1;
                }
                Ok(None)
            }
        }
    }

    /// Store an entry; oversized items are logged and skipped
    pub async fn set<V: CacheValue>(&self, key: &CacheKey, entry: &CacheEntry<V>) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let previous = self.lock_index().get(key).cloned();

        let bytes = match self.encode_within_capacity(key, entry) {
            Ok(bytes) => bytes,
            Err(e @ CacheError::CapacityRejection { .. }) => {
                warn!("{}; keeping it in memory only", e);
                self.lock_stats().rejections += 1;
                // An older copy must not outlive the value that replaced it
                if let Some(previous) = previous {
                    self.delete_quietly(&previous.storage_key).await;
                    self.lock_index().remove(key);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let storage_key = self.storage_key(&entry.category, key);
        if let Some(previous) = previous.filter(|p| p.storage_key != storage_key) {
            self.delete_quietly(&previous.storage_key).await;
        }

        let size_bytes = bytes.len();
        self.store.write(&storage_key, bytes).await?;
        self.lock_index().insert(
            key.clone(),
            IndexEntry {
                storage_key,
                created_at: entry.created_at,
                expires_at: entry.expires_at,
                category: entry.category.clone(),
                size_bytes,
            },
        );
        debug!("Persisted {} ({} bytes)", key, size_bytes);

        self.prune_if_needed().await?;
        Ok(())
    }

    /// Remove a specific entry
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let _write = self.write_lock.lock().await;
        let Some(meta) = self.lock_index().remove(key) else {
            return Ok(false);
        };

        self.store.delete(&meta.storage_key).await?;
        self.lock_stats().invalidations += 1;
        Ok(true)
    }

    /// Remove every entry matching `target`
    pub async fn invalidate(&self, target: &InvalidationTarget) -> Result<InvalidationEvent> {
        let _write = self.write_lock.lock().await;

        let matching: Vec<(CacheKey, String)> = self
            .lock_index()
            .iter()
            .filter(|(key, meta)| target.matches(key, &meta.category))
            .map(|(key, meta)| (key.clone(), meta.storage_key.clone()))
            .collect();

        let mut removed = Vec::with_capacity(matching.len());
        for (key, storage_key) in matching {
            self.store.delete(&storage_key).await?;
            self.lock_index().remove(&key);
            removed.push(key);
        }

        self.lock_stats().invalidations += removed.len() as u64;
        if !removed.is_empty() {
            debug!("Invalidated {} persistent entries ({:?})", removed.len(), target);
        }
        Ok(InvalidationEvent::new(
            InvalidationReason::Manual,
            TierKind::Persistent,
            removed,
        ))
    }

    /// Remove every item of the namespace, keeping the version marker
    pub async fn clear(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let purged = self.purge_namespace().await?;
        self.lock_index().clear();
        self.lock_stats().invalidations += purged as u64;
        info!("Cleared {} entries from persistent cache", purged);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_index().is_empty()
    }

    pub fn stats(&self) -> TierStats {
        let (entries, size_bytes) = {
            let index = self.lock_index();
            (index.len(), index.values().map(|e| e.size_bytes).sum())
        };
        TierStats {
            entries,
            size_bytes,
            ..self.lock_stats().clone()
        }
    }
}

#[async_trait]
impl<V: CacheValue> CacheTier<V> for PersistentCache {
    fn kind(&self) -> TierKind {
        TierKind::Persistent
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>> {
        PersistentCache::get(self, key).await
    }

    async fn set(&self, key: &CacheKey, entry: CacheEntry<V>) -> Result<()> {
        PersistentCache::set(self, key, &entry).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        PersistentCache::remove(self, key).await
    }

    async fn invalidate(&self, target: &InvalidationTarget) -> Result<InvalidationEvent> {
        PersistentCache::invalidate(self, target).await
    }

    async fn clear(&self) -> Result<()> {
        PersistentCache::clear(self).await
    }

    async fn stats(&self) -> TierStats {
        PersistentCache::stats(self)
    }
}
