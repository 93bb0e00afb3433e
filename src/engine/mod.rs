//! Run accounting shared by every trigger kind.

pub mod rate_limiter;
mod retry;

pub use rate_limiter::{FixedWindow, RateLimitConfig};
pub use retry::{RetryDecision, RetryPolicyConfig, RetryPolicyState};
