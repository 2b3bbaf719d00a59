//! Stale-while-revalidate classification

use crate::cache::entry::{chrono_duration, CacheEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where an entry sits relative to its freshness windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Within `created_at + ttl`; serve as is
    Fresh,

    /// Past its TTL but inside the stale window; serve and refresh in the background
    Stale,

    /// Beyond the stale window; a full miss
    Expired,
}

impl Freshness {
    pub fn is_usable(self) -> bool {
        !matches!(self, Freshness::Expired)
    }
}

/// Decides whether cached entries are fresh, stale or gone
#[derive(Debug, Clone, Default)]
pub struct StaleRevalidator {
    /// Cap applied on top of each entry's own stale window
    max_stale_tolerance: Option<Duration>,
}

impl StaleRevalidator {
    pub fn new(max_stale_tolerance: Option<Duration>) -> Self {
        Self { max_stale_tolerance }
    }

    /// Classify `entry` at `now`
    pub fn classify<V>(&self, entry: &CacheEntry<V>, now: DateTime<Utc>) -> Freshness {
        if entry.is_fresh_at(now) {
            return Freshness::Fresh;
        }

        if now <= self.stale_deadline(entry) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Last instant `entry` may still be served
    pub fn stale_deadline<V>(&self, entry: &CacheEntry<V>) -> DateTime<Utc> {
        match self.max_stale_tolerance {
            Some(cap) => entry
                .expires_at
                .min(entry.fresh_until + chrono_duration(cap)),
            None => entry.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::{Category, Priority};

    fn entry(ttl_ms: u64, stale_ms: u64) -> CacheEntry<&'static str> {
        CacheEntry::new("v", Duration::from_millis(ttl_ms), Category::Listing, Priority::Normal)
            .with_stale_tolerance(Duration::from_millis(stale_ms))
    }

    #[test]
    fn test_classify_windows() {
        let revalidator = StaleRevalidator::default();
        let e = entry(1_000, 2_000);

        let at = |ms: i64| e.created_at + chrono::Duration::milliseconds(ms);
        assert_eq!(revalidator.classify(&e, at(0)), Freshness::Fresh);
        assert_eq!(revalidator.classify(&e, at(1_000)), Freshness::Fresh);
        assert_eq!(revalidator.classify(&e, at(1_500)), Freshness::Stale);
        assert_eq!(revalidator.classify(&e, at(3_000)), Freshness::Stale);
        assert_eq!(revalidator.classify(&e, at(3_001)), Freshness::Expired);
    }

    #[test]
    fn test_no_stale_window_means_plain_ttl() {
        let revalidator = StaleRevalidator::default();
        let e = entry(1_000, 0);

        let after = e.created_at + chrono::Duration::milliseconds(1_001);
        assert_eq!(revalidator.classify(&e, after), Freshness::Expired);
        assert!(!Freshness::Expired.is_usable());
    }

    #[test]
    fn test_global_cap_shortens_stale_window() {
        let revalidator = StaleRevalidator::new(Some(Duration::from_millis(500)));
        let e = entry(1_000, 10_000);

        let at = |ms: i64| e.created_at + chrono::Duration::milliseconds(ms);
        assert_eq!(revalidator.classify(&e, at(1_400)), Freshness::Stale);
        assert_eq!(revalidator.classify(&e, at(1_600)), Freshness::Expired);
    }
}
