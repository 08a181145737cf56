//! Cachelimit - approximate sliding-window rate limiting on a shared cache
//!
//! Rate state lives in an external TTL-capable key-value store (memcache and
//! friends) rather than in process memory, so any number of processes can
//! enforce one limit. Each identity gets two per-minute counters and a
//! short-lived mitigation flag that rejects cheaply once the limit is hit.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{LimiterError, Result, StoreError};
pub use ratelimit::{Decision, Limiter, RateEstimate};
pub use store::{CounterStore, MemoryStore};
