//! Telemetry: structured logging and metric descriptions.
//!
//! - **Logging**: JSON/pretty/compact `tracing` output with per-module levels
//! - **Metrics**: descriptions for the counters the cache emits through the
//!   `metrics` facade; installing an exporter is left to the host process
//!
//! # Example
//!
//! ```rust,no_run
//! use cachet_core::telemetry::{init_logging, describe_metrics, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! describe_metrics();
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::describe_metrics;
