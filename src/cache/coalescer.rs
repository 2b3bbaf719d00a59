//! In-flight request coalescing
//!
//! At most one remote call runs per key. The first miss registers a
//! [`PendingOperation`] holding a [`Shared`] future; every caller that arrives
//! while it is registered awaits a clone of that same future and observes the
//! identical outcome. Registrations older than the pending timeout are no longer
//! handed out, so a call that never settles cannot block a key forever.

use crate::cache::entry::chrono_duration;
use crate::cache::ephemeral::EvictionGuard;
use crate::cache::types::{CacheKey, CacheValue};
use crate::error::RemoteError;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of a remote call as seen by every waiter
pub type RemoteResult<V> = std::result::Result<V, RemoteError>;

/// Future shared between all waiters of one remote call
pub type SharedOutcome<V> = Shared<BoxFuture<'static, RemoteResult<V>>>;

/// A remote call in flight
#[derive(Clone)]
pub struct PendingOperation<V: CacheValue> {
    /// Resolves once the call settles; clone it to wait
    pub future: SharedOutcome<V>,

    /// When the call was issued
    pub started_at: DateTime<Utc>,

    /// When new callers stop joining this call
    pub expires_at: DateTime<Utc>,

    /// Identifies this registration among successive calls for the same key
    pub signature: Uuid,
}

impl<V: CacheValue> PendingOperation<V> {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl<V: CacheValue> fmt::Debug for PendingOperation<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("started_at", &self.started_at)
            .field("expires_at", &self.expires_at)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Registry of in-flight remote calls keyed by cache key
pub struct Coalescer<V: CacheValue> {
    pending: Mutex<HashMap<CacheKey, PendingOperation<V>>>,
    timeout: Duration,
}

impl<V: CacheValue> Coalescer<V> {
    /// Create a coalescer whose registrations expire after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, PendingOperation<V>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_operation(&self, future: SharedOutcome<V>, signature: Uuid) -> PendingOperation<V> {
        let started_at = Utc::now();
        PendingOperation {
            future,
            started_at,
            expires_at: started_at + chrono_duration(self.timeout),
            signature,
        }
    }

    /// Register a call for `key`, replacing any previous registration
    pub fn register(&self, key: &CacheKey, future: SharedOutcome<V>) -> PendingOperation<V> {
        let operation = self.pending_operation(future, Uuid::new_v4());
        if self.lock().insert(key.clone(), operation.clone()).is_some() {
            debug!("Replaced pending operation for {}", key);
        }
        operation
    }

    /// Find the live call for `key`; an expired registration is released
    pub fn lookup(&self, key: &CacheKey) -> Option<PendingOperation<V>> {
        let mut pending = self.lock();
        Self::live_entry(&mut pending, key, Utc::now())
    }

    fn live_entry(
        pending: &mut HashMap<CacheKey, PendingOperation<V>>,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Option<PendingOperation<V>> {
        let expired = pending.get(key)?.is_expired_at(now);
        if expired {
            if let Some(stale) = pending.remove(key) {
                warn!(
                    "Releasing pending operation for {} after {:?} without settling",
                    key,
                    stale.age()
                );
            }
            return None;
        }
        pending.get(key).cloned()
    }

    /// Join the live call for `key` or register a new one built by `make`
    ///
    /// `make` receives the signature of the new registration and runs under the
    /// coalescer lock, so two racing misses can never both start a call. The
    /// returned flag is `true` when `make` was used.
    pub fn lookup_or_register<F>(&self, key: &CacheKey, make: F) -> (PendingOperation<V>, bool)
    where
        F: FnOnce(Uuid) -> SharedOutcome<V>,
    {
        let mut pending = self.lock();
        if let Some(existing) = Self::live_entry(&mut pending, key, Utc::now()) {
            return (existing, false);
        }

        let signature = Uuid::new_v4();
        let operation = self.pending_operation(make(signature), signature);
        pending.insert(key.clone(), operation.clone());
        (operation, true)
    }

    /// Release whatever is registered for `key`
    pub fn release(&self, key: &CacheKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Release `key` only if it is still the registration with `signature`
    pub fn release_matching(&self, key: &CacheKey, signature: Uuid) -> bool {
        let mut pending = self.lock();
        match pending.get(key) {
            Some(op) if op.signature == signature => {
                pending.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Release every registration past its expiry
    pub fn release_stale(&self) -> Vec<CacheKey> {
        let now = Utc::now();
        let mut released = Vec::new();
        self.lock().retain(|key, op| {
            let keep = !op.is_expired_at(now);
            if !keep {
                released.push(key.clone());
            }
            keep
        });

        if !released.is_empty() {
            warn!("Released {} stale pending operations", released.len());
        }
        released
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.lock()
            .get(key)
            .map(|op| !op.is_expired_at(Utc::now()))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<V: CacheValue> EvictionGuard for Coalescer<V> {
    fn is_protected(&self, key: &CacheKey) -> bool {
        self.is_pending(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn ready(value: u32) -> SharedOutcome<u32> {
        async move { Ok(value) }.boxed().shared()
    }

    #[tokio::test]
    async fn test_register_lookup_release() {
        let coalescer = Coalescer::<u32>::new(Duration::from_secs(30));
        let key = CacheKey::from("getDoctor:public:abc");

        assert!(coalescer.lookup(&key).is_none());
        coalescer.register(&key, ready(7));

        let found = coalescer.lookup(&key).unwrap();
        assert_eq!(found.future.await, Ok(7));
        assert!(coalescer.is_protected(&key));

        assert!(coalescer.release(&key));
        assert!(coalescer.lookup(&key).is_none());
        assert!(!coalescer.release(&key));
    }

    #[tokio::test]
    async fn test_lookup_or_register_builds_once() {
        let coalescer = Coalescer::<u32>::new(Duration::from_secs(30));
        let key = CacheKey::from("findDoctors:public:abc");
        let mut built = 0;

        let (first, created) = coalescer.lookup_or_register(&key, |_| {
            built += 1;
            ready(1)
        });
        assert!(created);

        let (second, created) = coalescer.lookup_or_register(&key, |_| {
            built += 1;
            ready(2)
        });
        assert!(!created);
        assert_eq!(built, 1);
        assert_eq!(first.signature, second.signature);
        assert_eq!(second.future.await, Ok(1));
    }

    #[tokio::test]
    async fn test_release_matching_ignores_newer_registration() {
        let coalescer = Coalescer::<u32>::new(Duration::from_secs(30));
        let key = CacheKey::from("op:public:1");

        let old = coalescer.register(&key, ready(1));
        let new = coalescer.register(&key, ready(2));

        assert!(!coalescer.release_matching(&key, old.signature));
        assert_eq!(coalescer.len(), 1);
        assert!(coalescer.release_matching(&key, new.signature));
        assert!(coalescer.is_empty());
    }

    #[tokio::test]
    async fn test_expired_registrations_are_released() {
        let coalescer = Coalescer::<u32>::new(Duration::from_millis(10));
        let a = CacheKey::from("op:public:a");
        let b = CacheKey::from("op:public:b");

        coalescer.register(&a, futures::future::pending::<RemoteResult<u32>>().boxed().shared());
        coalescer.register(&b, futures::future::pending::<RemoteResult<u32>>().boxed().shared());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!coalescer.is_protected(&a));
        assert!(coalescer.lookup(&a).is_none());
        assert_eq!(coalescer.len(), 1);

        let released = coalescer.release_stale();
        assert_eq!(released, vec![b]);
        assert!(coalescer.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let coalescer = Coalescer::<u32>::new(Duration::from_secs(30));
        let key = CacheKey::from("op:public:err");
        let failing = async { Err(RemoteError::failed("op", "boom")) }.boxed().shared();

        let op = coalescer.register(&key, failing);
        let waiter = coalescer.lookup(&key).unwrap();

        let (a, b) = tokio::join!(op.future, waiter.future);
        assert_eq!(a, b);
        assert!(a.is_err());
    }
}
