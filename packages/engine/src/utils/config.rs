// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. Optional `cadence.{toml,yaml,json}` in the working directory
//!    (or an explicit file passed to [`EngineConfig::load_from`])
//! 3. Environment variables, e.g. `CADENCE__RUNTIME__WORKERS=8`

use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler settings
    pub runtime: RuntimeConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Broker and driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of driver threads (0 = step everything on the broker thread)
    pub workers: usize,

    /// Upper bound accepted for `workers`
    pub max_workers: usize,

    /// Pause between drive cycles while a list has units (microseconds)
    pub cycle_pause_us: u64,

    /// How long an empty driver waits for new units before re-checking (milliseconds)
    pub idle_wait_ms: u64,

    /// Broker queue poll timeout (milliseconds)
    pub broker_poll_ms: u64,

    /// How often owning threads refresh their diagnostic snapshot (milliseconds)
    pub diag_interval_ms: u64,

    /// Warn when a unit has been draining longer than this (seconds)
    pub drain_warn_secs: u64,

    /// Prefix for broker and driver thread names
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_workers: 1024,
            cycle_pause_us: 100,
            idle_wait_ms: 10,
            broker_poll_ms: 50,
            diag_interval_ms: 500,
            drain_warn_secs: 10,
            thread_name: "cadence".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Set the number of driver threads
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the pause between drive cycles
    pub fn with_cycle_pause(mut self, pause: Duration) -> Self {
        self.cycle_pause_us = u64::try_from(pause.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Set the diagnostic snapshot interval
    pub fn with_diag_interval(mut self, interval: Duration) -> Self {
        self.diag_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the drain leak warning threshold
    pub fn with_drain_warn(mut self, after: Duration) -> Self {
        self.drain_warn_secs = after.as_secs();
        self
    }

    /// Set the thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_micros(self.cycle_pause_us)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    pub fn broker_poll(&self) -> Duration {
        Duration::from_millis(self.broker_poll_ms.max(1))
    }

    pub fn diag_interval(&self) -> Duration {
        Duration::from_millis(self.diag_interval_ms)
    }

    pub fn drain_warn(&self) -> Duration {
        Duration::from_secs(self.drain_warn_secs)
    }

    /// Validate runtime settings
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(EngineError::invalid_config("max_workers cannot be 0"));
        }
        if self.workers > self.max_workers {
            return Err(EngineError::invalid_config(format!(
                "workers ({}) exceeds max_workers ({})",
                self.workers, self.max_workers
            )));
        }
        if self.thread_name.is_empty() {
            return Err(EngineError::invalid_config("thread_name cannot be empty"));
        }
        Ok(())
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, `cadence.*` and the environment
    pub fn load() -> Result<Self> {
        Self::build(File::with_name("cadence").required(false))
    }

    /// Load configuration with an explicit file in place of `cadence.*`
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(File::from(path.as_ref()).required(true))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = Config::try_from(&EngineConfig::default())?;

        let config: EngineConfig = Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                Environment::with_prefix("CADENCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<()> {
        self.runtime.validate()
    }
}
