//! # Utility Modules
//!
//! Supporting utilities for logging, metrics and time.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup from configuration
//! - **Metrics**: Thread-safe dispatch counters
//! - **Time**: Wall clock and a manually driven clock for tests

pub mod logging;
pub mod metrics;
pub mod time;

pub use metrics::{Metrics, MetricsSnapshot};
pub use time::Clock;
