// packages/engine/src/utils/mod.rs
//! Shared utilities: configuration and error types

pub mod config;
pub mod errors;

pub use self::config::{EngineConfig, LoggingConfig, RuntimeConfig};
pub use errors::{EngineError, Result};
