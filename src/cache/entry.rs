//! Cache entry management with TTL and stale window support

use crate::cache::types::{Category, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest TTL an entry may carry; keeps `expires_at > created_at`
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// Longest lifetime any window may span
const MAX_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Convert a std duration to chrono, capped so timestamp arithmetic cannot overflow
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d.min(MAX_WINDOW)).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// A cached value with its freshness window and eviction metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// The cached value
    pub value: V,

    /// When the value was produced
    pub created_at: DateTime<Utc>,

    /// End of the fresh window (`created_at + ttl`)
    pub fresh_until: DateTime<Utc>,

    /// End of the stale window; the entry is logically absent afterwards
    pub expires_at: DateTime<Utc>,

    /// Category used for defaults and invalidation
    pub category: Category,

    /// Eviction priority
    pub priority: Priority,

    /// Approximate encoded size in bytes
    pub size_bytes: usize,
}

impl<V: Serialize> CacheEntry<V> {
    /// Create an entry that is fresh for `ttl` and has no stale window
    pub fn new(value: V, ttl: Duration, category: Category, priority: Priority) -> Self {
        Self::created_at(value, Utc::now(), ttl, category, priority)
    }

    /// Create an entry with an explicit creation time
    pub fn created_at(
        value: V,
        created_at: DateTime<Utc>,
        ttl: Duration,
        category: Category,
        priority: Priority,
    ) -> Self {
        let fresh_until = created_at + chrono_duration(ttl.max(MIN_TTL));
        let size_bytes = approximate_size(&value);

        Self {
            value,
            created_at,
            fresh_until,
            expires_at: fresh_until,
            category,
            priority,
            size_bytes,
        }
    }
}

impl<V> CacheEntry<V> {
    /// Keep the entry readable for `tolerance` after it stops being fresh
    pub fn with_stale_tolerance(mut self, tolerance: Duration) -> Self {
        self.expires_at = self.fresh_until + chrono_duration(tolerance);
        self
    }

    /// Check if the entry has outlived its stale window
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Check if the entry is still inside its fresh window
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.fresh_until
    }

    /// The configured fresh lifetime of this entry
    pub fn ttl(&self) -> Duration {
        (self.fresh_until - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Length of the stale window after `fresh_until`
    pub fn stale_tolerance(&self) -> Duration {
        (self.expires_at - self.fresh_until)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Get time until the entry becomes logically absent
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let now = Utc::now();
        if now > self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }
}

/// Approximate bytes a value occupies once encoded
pub fn approximate_size<V: Serialize>(value: &V) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .unwrap_or_else(|_| std::mem::size_of::<V>())
}
