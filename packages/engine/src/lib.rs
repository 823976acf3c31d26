// packages/engine/src/lib.rs
//! Cadence Engine Library
//!
//! A cooperative task-execution runtime: units of work implement a
//! non-blocking `step` function that is called until they finish, and a
//! broker distributes them across a pool of driver threads, optionally
//! pinning a unit to one driver.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: unit contract, submission queue, broker, drivers, lifecycle
//! - **observability**: tracing subscriber and metrics recorder setup
//! - **utils**: configuration and error types

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::{
    DriverId, Outcome, Runtime, RuntimeHandle, RuntimeStats, StepContext, Unit, UnitHandle, UnitId,
};
pub use utils::config::{EngineConfig, RuntimeConfig};
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(!info.git_hash.is_empty());
        assert!(!info.rustc_version.is_empty());
    }
}
