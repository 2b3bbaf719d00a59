//! # rpc-cache
//!
//! A multi-tier client-side cache and request-coalescing engine for
//! procedure-style remote APIs.
//!
//! ## Features
//!
//! - Two cache tiers: a synchronous in-process tier and a schema-versioned
//!   durable tier that survives restarts
//! - At most one in-flight remote call per key; concurrent callers share its outcome
//! - Per-operation debouncing of remote calls
//! - Stale-while-revalidate with at most one background refresh per key
//! - Identity-scoped keys so different callers never share private results
//! - Remote failures are never cached and are returned to callers unchanged
//!
//! ## Fetching through the cache
//!
//! ```no_run
//! use rpc_cache::{CacheConfig, Category, FetchOptions, MemoryStore, OperationPolicy, OperationRegistry, Orchestrator, RemoteError};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = OperationRegistry::builder()
//!         .register_fn("findDoctors", |args: Value, _identity: Option<String>| async move {
//!             Ok::<_, RemoteError>(json!({ "query": args, "doctors": [] }))
//!         })
//!         .build();
//!
//!     let config = CacheConfig::builder()
//!         .operation("findDoctors", OperationPolicy::public(Category::Listing))
//!         .build();
//!
//!     let cache: Orchestrator = Orchestrator::init(
//!         config,
//!         Arc::new(registry),
//!         Some(Arc::new(MemoryStore::new())),
//!     )
//!     .await?;
//!
//!     let doctors = cache
//!         .fetch("findDoctors", &json!({"specialty": "cardiology"}), None, FetchOptions::new())
//!         .await?;
//!     println!("{}", doctors);
//!
//!     cache.invalidate("listing").await;
//!     println!("{}", cache.stats().await);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod registry;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheKey, CacheKeyBuilder, CacheStats,
    CacheTier, CacheValue, Category, CategoryPolicy, DurableStore, FileStore, Freshness,
    InvalidationEvent, InvalidationReason, InvalidationTarget, MemoryStore, OperationPolicy,
    PersistentConfig, Priority,
};
pub use error::{CacheError, RemoteError, Result};
pub use orchestrator::{FetchOptions, FetchState, Orchestrator};
pub use registry::{OperationHandler, OperationRegistry, RemoteInvoker};
