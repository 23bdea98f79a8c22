//! Rate limiting logic and state management.

mod key;
mod limiter;
mod reaper;
mod registry;
mod window;

pub use key::ClientKey;
pub use limiter::{LimitPolicy, RateLimiter};
pub use reaper::Reaper;
pub use registry::KeyRegistry;
pub use window::{Algorithm, UsageRecord, Verdict};
