//! Rate limiting logic: key derivation, window estimation, and the limiter.

mod keys;
mod limiter;
mod window;

pub use keys::{IdentityKeys, KeySpace, MAX_DESCRIPTION_LEN, MAX_KEY_LEN, SEPARATOR};
pub use limiter::{Decision, Limiter, RateEstimate, DEFAULT_BUCKET_TTL, MITIGATION_TTL};
pub use window::{decay_weight, estimate_rate, would_exceed, Window};
