//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing-subscriber` setup with JSON/pretty/compact output and token redaction
//! - **Metrics**: counters and gauges recorded through the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use eventconnect_core::telemetry::{init_telemetry, LoggingConfig};
//!
//! init_telemetry(&LoggingConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{
    init_logging, LogFormat, LoggingConfig, RedactionConfig, RedactionPattern,
    SensitiveFieldRedactor,
};
pub use metrics::{describe_metrics, ConnectionMetrics, MessageMetrics, QueueMetrics};

/// Initialize logging and register metric descriptions.
///
/// Call once at application startup. Libraries embedding the session should
/// skip this and leave subscriber installation to the application.
pub fn init_telemetry(logging: &LoggingConfig) -> anyhow::Result<()> {
    describe_metrics();
    init_logging(logging)?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );
    Ok(())
}
