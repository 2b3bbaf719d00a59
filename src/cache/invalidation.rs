//! Explicit invalidation targets and audit events

use crate::cache::types::{CacheKey, Category, TierKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why entries left a tier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Entry outlived its stale window
    Expired,

    /// Removed by an explicit `invalidate` call
    Manual,

    /// Evicted to satisfy the in-process capacity ceiling
    CapacityEviction,

    /// Removed by a durable-tier pruning pass
    Pruned,

    /// Envelope could not be decoded
    Corrupt,

    /// Durable tier written by an incompatible schema version
    SchemaMismatch { found: Option<String> },

    /// Whole tier cleared
    Cleared,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "stale window elapsed"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::CapacityEviction => write!(f, "capacity eviction"),
            InvalidationReason::Pruned => write!(f, "storage pruning"),
            InvalidationReason::Corrupt => write!(f, "corrupt entry"),
            InvalidationReason::SchemaMismatch { found } => match found {
                Some(v) => write!(f, "schema version mismatch (found {})", v),
                None => write!(f, "schema version missing"),
            },
            InvalidationReason::Cleared => write!(f, "cleared"),
        }
    }
}

/// What an `invalidate` call removes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationTarget {
    /// Exactly one key
    Key(CacheKey),

    /// Every key starting with the prefix, or whose `{category}:{key}` form does
    Prefix(String),

    /// Every key of a category
    Category(Category),

    /// Everything
    All,
}

impl InvalidationTarget {
    /// Check whether an entry stored under `key` with `category` is targeted
    pub fn matches(&self, key: &CacheKey, category: &Category) -> bool {
        match self {
            InvalidationTarget::Key(k) => k == key,
            InvalidationTarget::Prefix(prefix) => {
                key.starts_with(prefix) || namespaced_matches(prefix, key, category)
            }
            InvalidationTarget::Category(c) => c == category,
            InvalidationTarget::All => true,
        }
    }
}

/// Prefix test against `{category}:{key}` without allocating
fn namespaced_matches(prefix: &str, key: &CacheKey, category: &Category) -> bool {
    let cat = category.as_str();
    match prefix.strip_prefix(cat) {
        Some("") => true,
        Some(rest) => match rest.strip_prefix(':') {
            Some(rest) => key.starts_with(rest),
            None => false,
        },
        None => cat.starts_with(prefix),
    }
}

impl From<CacheKey> for InvalidationTarget {
    fn from(key: CacheKey) -> Self {
        InvalidationTarget::Key(key)
    }
}

impl From<&CacheKey> for InvalidationTarget {
    fn from(key: &CacheKey) -> Self {
        InvalidationTarget::Key(key.clone())
    }
}

impl From<Category> for InvalidationTarget {
    fn from(category: Category) -> Self {
        InvalidationTarget::Category(category)
    }
}

impl From<&str> for InvalidationTarget {
    fn from(prefix: &str) -> Self {
        InvalidationTarget::Prefix(prefix.to_string())
    }
}

impl From<String> for InvalidationTarget {
    fn from(prefix: String) -> Self {
        InvalidationTarget::Prefix(prefix)
    }
}

/// Record of entries removed from one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// Tier the keys were removed from
    pub tier: TierKind,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were invalidated
    pub keys: Vec<CacheKey>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    pub fn new(reason: InvalidationReason, tier: TierKind, keys: Vec<CacheKey>) -> Self {
        Self {
            reason,
            tier,
            timestamp: Utc::now(),
            keys,
            context: None,
        }
    }

    /// Add context to the event
    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_reason_display() {
        assert_eq!(InvalidationReason::Expired.to_string(), "stale window elapsed");

        let reason = InvalidationReason::SchemaMismatch {
            found: Some("0.9.0".to_string()),
        };
        assert!(reason.to_string().contains("0.9.0"));
    }

    #[test]
    fn test_key_target() {
        let key = CacheKey::from("getDoctor:public:abc");
        let target = InvalidationTarget::from(&key);

        assert!(target.matches(&key, &Category::Profile));
        assert!(!target.matches(&CacheKey::from("getDoctor:public:abd"), &Category::Profile));
    }

    #[test]
    fn test_prefix_target_matches_key_and_category_forms() {
        let key = CacheKey::from("findDoctors:public:abc");

        assert!(InvalidationTarget::from("findDoctors:").matches(&key, &Category::Listing));
        assert!(InvalidationTarget::from("listing").matches(&key, &Category::Listing));
        assert!(InvalidationTarget::from("list").matches(&key, &Category::Listing));
        assert!(InvalidationTarget::from("listing:findDoctors").matches(&key, &Category::Listing));

        assert!(!InvalidationTarget::from("profile").matches(&key, &Category::Listing));
        assert!(!InvalidationTarget::from("listing:getDoctor").matches(&key, &Category::Listing));
        assert!(!InvalidationTarget::from("listingx").matches(&key, &Category::Listing));
    }

    #[test]
    fn test_category_target() {
        let key = CacheKey::from("getSlots:public:abc");
        let target = InvalidationTarget::from(Category::Availability);

        assert!(target.matches(&key, &Category::Availability));
        assert!(!target.matches(&key, &Category::Listing));
        assert!(InvalidationTarget::All.matches(&key, &Category::Listing));
    }

    #[test]
    fn test_invalidation_event() {
        let event = InvalidationEvent::new(
            InvalidationReason::Manual,
            TierKind::Ephemeral,
            vec![CacheKey::from("key1"), CacheKey::from("key2")],
        )
        .with_context("test context".to_string());

        assert_eq!(event.len(), 2);
        assert_eq!(event.context, Some("test context".to_string()));
        assert!(matches!(event.reason, InvalidationReason::Manual));
    }
}
