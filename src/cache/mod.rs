//! # Cache tiers and coordination primitives
//!
//! Building blocks the [`Orchestrator`](crate::Orchestrator) composes:
//!
//! - **Keys** ([`key`]): canonical `{operation}:{scope}:{digest}` keys, stable
//!   regardless of argument construction order
//! - **Ephemeral tier** ([`ephemeral`]): synchronous in-process map with lazy
//!   expiry and priority-ordered eviction
//! - **Persistent tier** ([`persistent`]): schema-versioned envelopes over a
//!   [`DurableStore`](durable::DurableStore), pruned oldest-first
//! - **Coalescer** ([`coalescer`]): one in-flight remote call per key
//! - **Debouncer** ([`debounce`]): minimum interval between remote calls per operation
//! - **Stale revalidator** ([`revalidate`]): fresh / stale / expired classification
//!
//! Both tiers implement [`CacheTier`], so the orchestrator treats them as an
//! ordered list.
//!
//! ## Example
//!
//! ```rust
//! use rpc_cache::cache::{CacheKeyBuilder, EphemeralCache, EphemeralConfig, Category, Priority};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let keys = CacheKeyBuilder::new();
//! let key = keys.build("getDoctor", None, &json!({"id": 123}));
//!
//! let cache = EphemeralCache::new(EphemeralConfig::default());
//! cache.set(key.clone(), "Dr. House".to_string(), Duration::from_secs(5), Category::Profile, Priority::High);
//!
//! assert_eq!(cache.get(&key), Some("Dr. House".to_string()));
//! ```

pub mod coalescer;
pub mod config;
pub mod debounce;
pub mod durable;
pub mod entry;
pub mod ephemeral;
pub mod invalidation;
pub mod key;
pub mod persistent;
pub mod revalidate;
pub mod tier;
pub mod types;

pub use coalescer::{Coalescer, PendingOperation, RemoteResult, SharedOutcome};
pub use config::{
    CacheConfig, CacheConfigBuilder, CategoryPolicy, EphemeralConfig, OperationPolicy,
    PersistentConfig,
};
pub use debounce::Debouncer;
pub use durable::{DurableStore, FileStore, MemoryStore};
pub use entry::{CacheEntry, MIN_TTL};
pub use ephemeral::{EphemeralCache, EvictionGuard};
pub use invalidation::{InvalidationEvent, InvalidationReason, InvalidationTarget};
pub use key::{canonicalize, CacheKeyBuilder, PUBLIC_SCOPE};
pub use persistent::PersistentCache;
pub use revalidate::{Freshness, StaleRevalidator};
pub use tier::CacheTier;
pub use types::{CacheKey, CacheStats, CacheValue, Category, Priority, TierKind, TierStats};
