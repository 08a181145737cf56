//! In-process counter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::CounterStore;
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::ratelimit::MAX_KEY_LEN;

/// Default interval between sweeps of expired entries on write.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// A stored value and the instant it stops existing.
#[derive(Debug, Clone)]
struct Slot {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// A [`CounterStore`] kept in local memory.
///
/// Behaves like a single memcache node: keys are capped at 250 bytes,
/// counters are ASCII decimal, and expiry is judged against the injected
/// [`Clock`]. Expired entries read as absent and are dropped lazily.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    purge_interval: Duration,
    last_purge: Mutex<DateTime<Utc>>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store that judges expiry with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            entries: DashMap::new(),
            clock,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            last_purge: Mutex::new(now),
        }
    }

    /// Set how often writes sweep expired entries. Zero sweeps on every write.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Number of entries held, including expired ones not yet dropped.
    pub fn stored_len(&self) -> usize {
        self.entries.len()
    }

    /// True when no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        *self.last_purge.lock() = now;
        self.sweep(now);
    }

    fn sweep(&self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            debug!(dropped = dropped, remaining = self.entries.len(), "Purged expired entries");
        }
    }

    /// Sweep if the purge interval has elapsed. Must not be called while
    /// holding a map guard.
    fn maybe_purge(&self, now: DateTime<Utc>) {
        // Another writer already sweeping is as good as sweeping here.
        let Some(mut last) = self.last_purge.try_lock() else {
            return;
        };
        let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.purge_interval {
            return;
        }
        *last = now;
        drop(last);

        self.sweep(now);
    }

    fn check_key(key: &str) -> Result<(), StoreError> {
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::Rejected(format!(
                "key of {} bytes exceeds {} byte limit",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(())
    }

    fn deadline(now: DateTime<Utc>, ttl: Duration) -> Result<Option<DateTime<Utc>>, StoreError> {
        // Zero means "never expires", as in memcache.
        if ttl.is_zero() {
            return Ok(None);
        }
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map(Some)
            .ok_or_else(|| StoreError::Rejected(format!("ttl {:?} out of range", ttl)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_counter(key: &str, bytes: &[u8]) -> Result<u64, StoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| StoreError::Rejected(format!("value at {} is not a decimal counter", key)))
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Self::check_key(key)?;
        let now = self.clock.now();

        let found = self
            .entries
            .get(key)
            .map(|slot| slot.is_live(now).then(|| slot.value.clone()));

        match found {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, slot| !slot.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        Self::check_key(key)?;
        let now = self.clock.now();
        let slot = Slot {
            value: value.to_vec(),
            expires_at: Self::deadline(now, ttl)?,
        };
        self.entries.insert(key.to_string(), slot);
        trace!(key = %key, ttl_secs = ttl.as_secs(), "Stored value");

        self.maybe_purge(now);
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial_if_absent: u64,
        ttl_if_created: Option<Duration>,
    ) -> Result<u64, StoreError> {
        Self::check_key(key)?;
        let now = self.clock.now();

        let fresh = |value: u64| -> Result<Slot, StoreError> {
            let expires_at = match ttl_if_created {
                Some(ttl) => Self::deadline(now, ttl)?,
                None => None,
            };
            Ok(Slot {
                value: value.to_string().into_bytes(),
                expires_at,
            })
        };

        // The entry guard holds the shard lock, so read-modify-write is atomic per key.
        let value = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let current = parse_counter(key, &occupied.get().value)?;
                let next = current.wrapping_add(delta);
                occupied.get_mut().value = next.to_string().into_bytes();
                next
            }
            Entry::Occupied(mut occupied) => {
                let next = initial_if_absent.wrapping_add(delta);
                occupied.insert(fresh(next)?);
                next
            }
            Entry::Vacant(vacant) => {
                let next = initial_if_absent.wrapping_add(delta);
                vacant.insert(fresh(next)?);
                next
            }
        };

        trace!(key = %key, value = value, "Incremented counter");

        self.maybe_purge(now);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn test_store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let (store, _) = test_store();
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _) = test_store();
        store.set_with_ttl("k", &[1], Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1]));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_value_expires_after_ttl() {
        let (store, clock) = test_store();
        store.set_with_ttl("k", &[1], Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_refreshes_ttl() {
        let (store, clock) = test_store();
        store.set_with_ttl("k", &[1], Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(45));
        store.set_with_ttl("k", &[1], Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(45));

        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let (store, clock) = test_store();
        store.set_with_ttl("k", b"v", Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(86_400));
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_increment_creates_with_initial_plus_delta() {
        let (store, _) = test_store();
        assert_eq!(store.increment("c", 1, 10, None).await.unwrap(), 11);
        assert_eq!(store.increment("c", 2, 10, None).await.unwrap(), 13);
        assert_eq!(store.get("c").await.unwrap(), Some(b"13".to_vec()));
    }

    #[tokio::test]
    async fn test_increment_keeps_original_ttl() {
        let (store, clock) = test_store();
        store
            .increment("c", 1, 0, Some(Duration::from_secs(120)))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(100));
        store
            .increment("c", 1, 0, Some(Duration::from_secs(120)))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(20));
        assert_eq!(store.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_increment_after_expiry_starts_over() {
        let (store, clock) = test_store();
        store.increment("c", 5, 0, Some(Duration::from_secs(10))).await.unwrap();
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.increment("c", 1, 0, None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_non_numeric_is_rejected() {
        let (store, _) = test_store();
        store.set_with_ttl("c", b"abc", Duration::from_secs(60)).await.unwrap();
        let err = store.increment("c", 1, 0, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_oversized_key_is_rejected() {
        let (store, _) = test_store();
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(store.get(&key).await, Err(StoreError::Rejected(_))));
        assert!(store.get(&"k".repeat(MAX_KEY_LEN)).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_increments_do_not_lose_updates() {
        let (store, _) = test_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.increment("shared", 1, 0, None).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("shared").await.unwrap(), Some(b"800".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = test_store();
        store.set_with_ttl("short", &[1], Duration::from_secs(1)).await.unwrap();
        store.set_with_ttl("long", &[1], Duration::from_secs(100)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        store.purge_expired();

        assert_eq!(store.entries.len(), 1);
        assert!(store.entries.contains_key("long"));
    }

    #[tokio::test]
    async fn test_writes_reclaim_keys_that_are_never_read_again() {
        let (store, clock) = test_store();
        let ttl = Some(Duration::from_secs(120));
        for i in 0..1000 {
            store.increment(&format!("login|u{}:0", i), 1, 0, ttl).await.unwrap();
        }
        assert_eq!(store.entries.len(), 1000);

        clock.advance(Duration::from_secs(600));
        store.increment("login|fresh:10", 1, 0, ttl).await.unwrap();

        assert_eq!(store.entries.len(), 1);
        assert!(store.entries.contains_key("login|fresh:10"));
    }

    #[tokio::test]
    async fn test_writes_sweep_at_most_once_per_interval() {
        let (store, clock) = test_store();
        let store = store.with_purge_interval(Duration::from_secs(60));
        store.set_with_ttl("a", &[1], Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_secs(30));
        store.set_with_ttl("b", &[1], Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.entries.len(), 2);

        clock.advance(Duration::from_secs(30));
        store.set_with_ttl("c", &[1], Duration::from_secs(100)).await.unwrap();
        assert_eq!(store.entries.len(), 1);
        assert!(store.entries.contains_key("c"));
    }

    #[tokio::test]
    async fn test_zero_purge_interval_sweeps_every_write() {
        let (store, clock) = test_store();
        let store = store.with_purge_interval(Duration::ZERO);
        store.set_with_ttl("a", &[1], Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_secs(1));
        store.increment("b", 1, 0, None).await.unwrap();
        assert_eq!(store.entries.len(), 1);
    }
}
