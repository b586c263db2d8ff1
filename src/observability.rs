//! Logging setup and self-observability metric names.
//!
//! Counters and gauges go through the `metrics` facade; no recorder is
//! installed here, so they are free until the host installs one.

use metrics::{describe_counter, describe_gauge};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Lines read, by log file
pub const LINES_TOTAL: &str = "hogtail_lines_total";
/// Log streams currently open
pub const LOG_COUNT: &str = "hogtail_log_count";
/// Read or open failures, by log file
pub const LOG_ERRORS_TOTAL: &str = "hogtail_log_errors_total";
pub const PROG_LOADS_TOTAL: &str = "hogtail_prog_loads_total";
pub const PROG_LOAD_ERRORS_TOTAL: &str = "hogtail_prog_load_errors_total";
pub const PROG_RUNTIME_ERRORS: &str = "hogtail_prog_runtime_errors_total";
/// Push attempts, by target
pub const EXPORT_TOTAL: &str = "hogtail_export_total";
pub const EXPORT_SUCCESS_TOTAL: &str = "hogtail_export_success_total";

/// Install the global tracing subscriber.
///
/// The filter defaults to `info` and is overridden by `RUST_LOG`. Calling
/// this twice is an error.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    register_metrics();
    Ok(())
}

/// Describe every self-observability metric
pub fn register_metrics() {
    describe_counter!(LINES_TOTAL, "Number of lines read, by log file");
    describe_gauge!(LOG_COUNT, "Number of log streams being tailed");
    describe_counter!(LOG_ERRORS_TOTAL, "Number of open or read errors, by log file");
    describe_counter!(PROG_LOADS_TOTAL, "Number of successful program loads, by program");
    describe_counter!(PROG_LOAD_ERRORS_TOTAL, "Number of failed program loads, by program");
    describe_counter!(
        PROG_RUNTIME_ERRORS,
        "Number of lines whose execution was terminated by an error, by program"
    );
    describe_counter!(EXPORT_TOTAL, "Number of push attempts, by target");
    describe_counter!(EXPORT_SUCCESS_TOTAL, "Number of successful pushes, by target");
}
