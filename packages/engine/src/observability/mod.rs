// packages/engine/src/observability/mod.rs
//! Logging and metrics setup
//!
//! The library only emits through `tracing` and `metrics` macros; both are
//! no-ops until the binary installs a subscriber and a recorder here.

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Metric names emitted by the runtime
pub mod names {
    pub const UNITS_SUBMITTED: &str = "cadence_units_submitted_total";
    pub const UNITS_DISPATCHED: &str = "cadence_units_dispatched_total";
    pub const UNITS_RETIRED: &str = "cadence_units_retired_total";
    pub const UNITS_FAILED: &str = "cadence_units_failed_total";
    pub const AFFINITY_CLAMPED: &str = "cadence_affinity_clamped_total";
    pub const DRIVERS_STARTED: &str = "cadence_drivers_started_total";
    pub const DRIVER_UNITS: &str = "cadence_driver_units";
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::invalid_config(format!("log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .try_init()
    };

    result.map_err(|e| EngineError::invalid_config(format!("tracing: {}", e)))
}

/// Install the Prometheus metrics recorder
///
/// No listener is started; render the returned handle to export.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::Metrics(e.to_string()))?;

    metrics::describe_counter!(names::UNITS_SUBMITTED, "Units accepted by submit");
    metrics::describe_counter!(names::UNITS_DISPATCHED, "Units handed to a driver or the broker list");
    metrics::describe_counter!(names::UNITS_RETIRED, "Units drained and returned to their owner");
    metrics::describe_counter!(names::UNITS_FAILED, "Units whose work finished negative");
    metrics::describe_counter!(names::AFFINITY_CLAMPED, "Desired driver ids clamped into range");
    metrics::describe_counter!(names::DRIVERS_STARTED, "Driver threads started");
    metrics::describe_gauge!(names::DRIVER_UNITS, "Units currently owned per driver");

    Ok(handle)
}
