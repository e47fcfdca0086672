//! # Utility Modules
//!
//! Supporting utilities used by the listener and the coordinator.
//!
//! ## Components
//! - **Rate Limit**: `"N/interval"` parsing and a sliding-window limiter
//! - **Watchdog**: heartbeat liveness tracking
//! - **Metrics**: thread-safe observability counters
//! - **Logging**: tracing subscriber setup

pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod watchdog;

pub use rate_limit::{RateSpec, WindowRateLimiter};
pub use watchdog::Heartbeat;
