//! Core type definitions for the cache system

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Values the engine can hold: cloned out to every waiter and persisted as JSON
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Opaque cache key
///
/// Produced by [`CacheKeyBuilder`](crate::cache::CacheKeyBuilder) for orchestrated
/// traffic. The `From` conversions exist for direct tier access.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub(crate) fn from_parts(raw: String) -> Self {
        CacheKey(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        CacheKey(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        CacheKey(s)
    }
}

/// Grouping of keys that share TTL and eviction defaults
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Category {
    /// Identity and doctor profiles
    Profile,

    /// Search results and directory listings
    Listing,

    /// Appointment slot availability
    Availability,

    /// Conversations and notifications
    Message,

    /// Anything without a dedicated policy
    General,

    /// Application-defined category
    Custom(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Profile => "profile",
            Category::Listing => "listing",
            Category::Availability => "availability",
            Category::Message => "message",
            Category::General => "general",
            Category::Custom(name) => name.as_str(),
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::General
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        match s.as_str() {
            "profile" => Category::Profile,
            "listing" => Category::Listing,
            "availability" => Category::Availability,
            "message" => Category::Message,
            "general" => Category::General,
            _ => Category::Custom(s),
        }
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Category::from(s.to_string())
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.as_str().to_string()
    }
}

/// Eviction priority; lower priorities are evicted first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Which kind of storage a tier is backed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierKind {
    /// In-process map, lost on restart
    Ephemeral,

    /// Durable key-value substrate
    Persistent,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Ephemeral => write!(f, "ephemeral"),
            TierKind::Persistent => write!(f, "persistent"),
        }
    }
}

/// Counters kept by a single tier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    /// Number of entries currently held
    pub entries: usize,

    /// Approximate bytes held
    pub size_bytes: usize,

    /// Entries removed to satisfy a capacity ceiling
    pub evictions: u64,

    /// Entries dropped because they outlived their stale window
    pub expirations: u64,

    /// Entries removed by explicit invalidation
    pub invalidations: u64,

    /// Items refused because they were too large
    pub rejections: u64,

    /// Entries dropped because they could not be decoded
    pub corrupt: u64,
}

/// Engine-wide statistics returned by `Orchestrator::stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Fresh and stale hits across all tiers
    pub hits: u64,

    /// Requests not served from a cache tier
    pub misses: u64,

    /// Capacity evictions summed over all tiers
    pub evictions: u64,

    /// Remote calls currently in flight
    pub pending_count: usize,

    /// Entries held by the persistent tier
    pub persistent_entry_count: usize,

    /// Entries held by the ephemeral tier
    pub ephemeral_entries: usize,

    /// Hits served from the stale window
    pub stale_hits: u64,

    /// Requests that joined an in-flight call
    pub coalesced: u64,

    /// Requests served from the debounce window
    pub debounced: u64,

    /// Remote invocations actually issued
    pub remote_calls: u64,

    /// Remote invocations that failed
    pub remote_failures: u64,

    /// Background refreshes started by stale reads
    pub refreshes: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, evictions: {}, pending: {}, persistent: {}, remote_calls: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.evictions,
            self.pending_count,
            self.persistent_entry_count,
            self.remote_calls
        )
    }
}
