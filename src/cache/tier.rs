//! Uniform interface over cache tiers
//!
//! The orchestrator walks an ordered `Vec<Arc<dyn CacheTier<V>>>`, cheapest
//! first. Adding, removing or reordering tiers never touches its control flow.

use crate::cache::entry::CacheEntry;
use crate::cache::invalidation::{InvalidationEvent, InvalidationTarget};
use crate::cache::types::{CacheKey, CacheValue, TierKind, TierStats};
use crate::error::Result;
use async_trait::async_trait;

/// A storage tier the orchestrator can read through and write back to
#[async_trait]
pub trait CacheTier<V: CacheValue>: Send + Sync {
    /// Kind of storage behind this tier
    fn kind(&self) -> TierKind;

    /// Look up a live (not yet expired) entry
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<V>>>;

    /// Store an entry, replacing any previous one for the key
    async fn set(&self, key: &CacheKey, entry: CacheEntry<V>) -> Result<()>;

    /// Remove one key, returning whether it was present
    async fn remove(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every entry the target matches
    async fn invalidate(&self, target: &InvalidationTarget) -> Result<InvalidationEvent>;

    /// Remove everything
    async fn clear(&self) -> Result<()>;

    /// Current counters
    async fn stats(&self) -> TierStats;
}
