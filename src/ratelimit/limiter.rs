//! Store-backed sliding-window limiter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::keys::{IdentityKeys, KeySpace};
use super::window::Window;
use crate::clock::{Clock, SystemClock};
use crate::error::{LimiterError, Result, StoreError};
use crate::store::CounterStore;

/// How long a mitigation flag lives once written.
pub const MITIGATION_TTL: Duration = Duration::from_secs(60);

/// Default lifetime of a minute bucket. Buckets older than two minutes are never read.
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(120);

/// Payload of the mitigation flag. Only its presence matters.
const MITIGATION_SENTINEL: &[u8] = &[1];

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The hit was counted and may proceed.
    Allowed,
    /// The identity is over its rate and is being rejected for the cooldown.
    Mitigated,
}

impl Decision {
    /// True for [`Decision::Mitigated`].
    pub fn is_mitigated(&self) -> bool {
        matches!(self, Decision::Mitigated)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allowed => write!(f, "allowed"),
            Decision::Mitigated => write!(f, "mitigated"),
        }
    }
}

/// Read-only view of an identity's limiter state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateEstimate {
    /// Whether the mitigation flag is currently set.
    pub mitigated: bool,
    /// Hits recorded in the previous minute bucket.
    pub previous: u64,
    /// Hits recorded in the current minute bucket.
    pub current: u64,
    /// Share of `previous` still inside the window.
    pub weight: f64,
    /// `previous * weight + current`
    pub rate: f64,
}

/// Approximate sliding-window rate limiter.
///
/// All state lives in the [`CounterStore`]; the limiter itself is immutable
/// and can be shared freely across tasks. Each check costs at most four
/// sequential store round trips:
///
/// 1. read the mitigation flag (short-circuits when set),
/// 2. read the current minute bucket,
/// 3. read the previous minute bucket,
/// 4. either write the mitigation flag or increment the current bucket.
///
/// Reading and incrementing are separate operations, so concurrent callers
/// for one identity may decide on a slightly stale count. Increments
/// themselves are never lost.
pub struct Limiter<S> {
    keys: KeySpace,
    max_hits_per_minute: u64,
    store: S,
    clock: Arc<dyn Clock>,
    bucket_ttl: Duration,
}

impl<S> fmt::Debug for Limiter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("description", &self.keys.description())
            .field("max_hits_per_minute", &self.max_hits_per_minute)
            .field("bucket_ttl", &self.bucket_ttl)
            .finish()
    }
}

impl<S: CounterStore> Limiter<S> {
    /// Create a limiter for the namespace `description`.
    ///
    /// Fails with [`LimiterError::Config`] if the description is longer than
    /// 248 bytes or contains the key separator.
    pub fn new(description: impl Into<String>, max_hits_per_minute: u64, store: S) -> Result<Self> {
        Ok(Self {
            keys: KeySpace::new(description)?,
            max_hits_per_minute,
            store,
            clock: Arc::new(SystemClock::new()),
            bucket_ttl: DEFAULT_BUCKET_TTL,
        })
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the expiry given to newly created minute buckets.
    pub fn with_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_ttl = ttl;
        self
    }

    /// The namespace prefix.
    pub fn description(&self) -> &str {
        self.keys.description()
    }

    /// The configured threshold.
    pub fn max_hits_per_minute(&self) -> u64 {
        self.max_hits_per_minute
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decide whether `identity` is over its rate, counting this call as a hit.
    ///
    /// Returns [`Decision::Mitigated`] while the identity's mitigation flag
    /// is set, or when this call detects a breach (which sets the flag).
    /// Otherwise the current bucket is incremented and the call is
    /// [`Decision::Allowed`].
    ///
    /// Store failures are returned as errors, never folded into a decision.
    /// Cancelling `ctx` aborts the pending store call with
    /// [`LimiterError::Canceled`]; a write that already landed stays and
    /// expires on its own.
    pub async fn limited(&self, ctx: &CancellationToken, identity: &str) -> Result<Decision> {
        let keys = self.keys.derive(identity)?;

        if self.is_mitigated(ctx, &keys).await? {
            trace!(key = %keys.base(), "Identity already mitigated");
            return Ok(Decision::Mitigated);
        }

        let window = Window::at(self.clock.now());
        let current = self.read_bucket(ctx, &keys, window.current_minute).await?;
        let previous = self.read_bucket(ctx, &keys, window.previous_minute).await?;
        let rate = window.estimate(previous, current);

        trace!(
            key = %keys.base(),
            previous = previous,
            current = current,
            second = window.second,
            rate = rate,
            "Estimated rate"
        );

        // This call is the next hit, so it counts toward the breach check.
        if window.would_exceed(previous, current, 1, self.max_hits_per_minute) {
            debug!(
                key = %keys.base(),
                rate = rate,
                limit = self.max_hits_per_minute,
                "Rate limit exceeded, mitigating"
            );
            self.mitigate(ctx, &keys).await?;
            return Ok(Decision::Mitigated);
        }

        self.record_hit(ctx, &keys, window.current_minute).await?;
        Ok(Decision::Allowed)
    }

    /// Inspect an identity without counting a hit or writing anything.
    pub async fn estimate(&self, ctx: &CancellationToken, identity: &str) -> Result<RateEstimate> {
        let keys = self.keys.derive(identity)?;
        let mitigated = self.is_mitigated(ctx, &keys).await?;

        let window = Window::at(self.clock.now());
        let current = self.read_bucket(ctx, &keys, window.current_minute).await?;
        let previous = self.read_bucket(ctx, &keys, window.previous_minute).await?;

        Ok(RateEstimate {
            mitigated,
            previous,
            current,
            weight: window.weight(),
            rate: window.estimate(previous, current),
        })
    }

    async fn is_mitigated(&self, ctx: &CancellationToken, keys: &IdentityKeys) -> Result<bool> {
        let flag = guarded(ctx, self.store.get(&keys.mitigated())).await?;
        Ok(flag.is_some())
    }

    async fn mitigate(&self, ctx: &CancellationToken, keys: &IdentityKeys) -> Result<()> {
        guarded(
            ctx,
            self.store
                .set_with_ttl(&keys.mitigated(), MITIGATION_SENTINEL, MITIGATION_TTL),
        )
        .await
    }

    async fn read_bucket(
        &self,
        ctx: &CancellationToken,
        keys: &IdentityKeys,
        minute: u32,
    ) -> Result<u64> {
        let key = keys.bucket(minute);
        let value = guarded(ctx, self.store.get(&key)).await?;
        match value {
            None => Ok(0),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or(LimiterError::InvalidCounter { key }),
        }
    }

    async fn record_hit(
        &self,
        ctx: &CancellationToken,
        keys: &IdentityKeys,
        minute: u32,
    ) -> Result<()> {
        let key = keys.bucket(minute);
        let count = guarded(
            ctx,
            self.store.increment(&key, 1, 0, Some(self.bucket_ttl)),
        )
        .await?;
        trace!(key = %key, count = count, "Recorded hit");
        Ok(())
    }
}

/// Run a store call unless `ctx` is cancelled first.
async fn guarded<T, F>(ctx: &CancellationToken, op: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(LimiterError::Canceled),
        result = op => result.map_err(LimiterError::from),
    }
}
