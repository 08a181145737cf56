//! Counter store capability.
//!
//! The limiter keeps no state of its own. Everything lives behind this
//! trait, which models the handful of primitives a memcache-like service
//! offers: plain reads, writes with expiry, and atomic increments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

mod memory;

pub use memory::{MemoryStore, DEFAULT_PURGE_INTERVAL};

/// Trait for shared, TTL-capable key-value stores.
///
/// Implementations must be safe to call from many tasks at once. Every
/// method may suspend on network I/O; retries and timeouts are the
/// implementation's business.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a value. `Ok(None)` means the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value that expires `ttl` after the write.
    ///
    /// Overwrites any existing value and resets its expiry.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Atomically add `delta` to the decimal counter at `key`.
    ///
    /// An absent key is created holding `initial_if_absent + delta`, expiring
    /// after `ttl_if_created` when one is given. An existing key keeps its
    /// expiry. Returns the counter value after the increment.
    async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial_if_absent: u64,
        ttl_if_created: Option<Duration>,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial_if_absent: u64,
        ttl_if_created: Option<Duration>,
    ) -> Result<u64, StoreError> {
        (**self)
            .increment(key, delta, initial_if_absent, ttl_if_created)
            .await
    }
}
