//! Failsafe mechanisms: two-tier rate limiting and retry with backoff

mod rate_limiter;
mod retry;
mod window;

pub use rate_limiter::{Denial, RateLimitGovernor, RateLimitInfo, Reservation, WindowSnapshot};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy, Sleeper, TokioSleeper};
pub use window::{QuotaPeriod, RateLimitWindow, WindowCheck, WindowKind};
