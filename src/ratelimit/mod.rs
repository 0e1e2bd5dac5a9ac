//! Rate decision engine: counting keys, policy and the limiter itself.

mod key;
mod limiter;
mod policy;

pub use key::{CountingKey, Namespace};
pub use limiter::{RateLimiter, WINDOW};
pub use policy::{LimitRule, Policy};
