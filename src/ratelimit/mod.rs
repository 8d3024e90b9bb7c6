//! Rate limiting logic and state management.

mod clock;
mod key;
mod limiter;
mod limits;
mod maintenance;
pub mod metrics;
mod registry;
pub mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::RateLimitKey;
pub use limiter::{KeyStatus, RateLimiter};
pub use limits::{Algorithm, LimitSpec, LimiterConfig};
pub use maintenance::{Maintenance, MIN_SWEEP_PERIOD};
pub use metrics::{DecisionRecord, KeyCounts, Metrics, MetricsSnapshot};
pub use registry::{LimiterEntry, LimiterRegistry, RegistryOptions, INLINE_SWEEP_INTERVAL};
pub use strategy::{Admission, Decision, Outcome, Strategy, StrategyStatus};
