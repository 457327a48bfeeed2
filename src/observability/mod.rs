//! # Observability
//!
//! Observability modules for metrics and logging.
//!
//! - `collector`: pull-based gauges counting shared resources
//! - `metrics`: operator self-metrics (ensure passes, deployment reconciles)
//! - `logging`: tracing subscriber setup and the runtime log level handle

pub mod collector;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use collector::{ListerError, ShareCollector, ShareLister};
pub use metrics::OperatorMetrics;
