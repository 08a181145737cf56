//! Shared fixtures for limiter integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use cachelimit::{CounterStore, Limiter, ManualClock, MemoryStore, StoreError};

/// A store operation as seen by the instrumented stores below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(String),
    Set(String),
    Increment(String),
}

impl Call {
    pub fn key(&self) -> &str {
        match self {
            Call::Get(k) | Call::Set(k) | Call::Increment(k) => k,
        }
    }

    pub fn is_bucket(&self) -> bool {
        !self.key().ends_with(":mitigated")
    }
}

/// Wraps a [`MemoryStore`] and records every call.
pub struct RecordingStore {
    inner: MemoryStore,
    calls: Mutex<Vec<Call>>,
}

impl RecordingStore {
    pub fn new(clock: &ManualClock) -> Self {
        Self {
            inner: MemoryStore::with_clock(Arc::new(clock.clone())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn bucket_reads(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Get(_)) && c.is_bucket())
            .count()
    }
}

#[async_trait]
impl CounterStore for RecordingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.calls.lock().push(Call::Get(key.to_string()));
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.calls.lock().push(Call::Set(key.to_string()));
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial_if_absent: u64,
        ttl_if_created: Option<Duration>,
    ) -> Result<u64, StoreError> {
        self.calls.lock().push(Call::Increment(key.to_string()));
        self.inner
            .increment(key, delta, initial_if_absent, ttl_if_created)
            .await
    }
}

/// Which operation a [`FailingStore`] breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    MitigationRead,
    BucketRead,
    MitigationWrite,
    Increment,
}

/// A [`MemoryStore`] that reports the backend unavailable for one kind of call.
pub struct FailingStore {
    inner: MemoryStore,
    failure: Failure,
    failures: AtomicUsize,
}

impl FailingStore {
    pub fn new(clock: &ManualClock, failure: Failure) -> Self {
        Self {
            inner: MemoryStore::with_clock(Arc::new(clock.clone())),
            failure,
            failures: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn fail(&self) -> StoreError {
        self.failures.fetch_add(1, Ordering::SeqCst);
        StoreError::Unavailable("connection refused".to_string())
    }
}

#[async_trait]
impl CounterStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let is_flag = key.ends_with(":mitigated");
        match self.failure {
            Failure::MitigationRead if is_flag => Err(self.fail()),
            Failure::BucketRead if !is_flag => Err(self.fail()),
            _ => self.inner.get(key).await,
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        if self.failure == Failure::MitigationWrite {
            return Err(self.fail());
        }
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn increment(
        &self,
        key: &str,
        delta: u64,
        initial_if_absent: u64,
        ttl_if_created: Option<Duration>,
    ) -> Result<u64, StoreError> {
        if self.failure == Failure::Increment {
            return Err(self.fail());
        }
        self.inner
            .increment(key, delta, initial_if_absent, ttl_if_created)
            .await
    }
}

/// A store whose calls never complete.
pub struct StalledStore;

#[async_trait]
impl CounterStore for StalledStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        std::future::pending().await
    }

    async fn set_with_ttl(
        &self,
        _key: &str,
        _value: &[u8],
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn increment(
        &self,
        _key: &str,
        _delta: u64,
        _initial_if_absent: u64,
        _ttl_if_created: Option<Duration>,
    ) -> Result<u64, StoreError> {
        std::future::pending().await
    }
}

/// A manual clock at 2024-01-01 `h:m:s` UTC.
pub fn clock_at(h: u32, m: u32, s: u32) -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap())
}

/// A limiter over `store` driven by `clock`.
pub fn limiter<S: CounterStore>(
    description: &str,
    max: u64,
    store: S,
    clock: &ManualClock,
) -> Limiter<S> {
    Limiter::new(description, max, store)
        .unwrap()
        .with_clock(Arc::new(clock.clone()))
}

/// Read a bucket counter straight from the store.
pub async fn counter<S: CounterStore>(store: &S, key: &str) -> Option<u64> {
    store
        .get(key)
        .await
        .unwrap()
        .map(|bytes| String::from_utf8(bytes).unwrap().parse().unwrap())
}
