// packages/engine/src/utils/errors.rs
//! Error types for the engine
//!
//! Only structural failures live here (configuration, thread creation,
//! queue exhaustion, misuse of the ownership protocol). A unit's own work
//! failure is never an error value: it is reported through the unit's
//! `Outcome::Negative` and the unit's own log lines.

use crate::runtime::unit::UnitId;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the runtime and its configuration layer
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Worker count or driver hook changed after the first submission
    #[error("Runtime configuration is frozen after the first submission")]
    ConfigFrozen,

    /// The OS refused to create a broker or driver thread
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    /// The submission queue has no consumer anymore
    #[error("Submission queue closed")]
    QueueClosed,

    /// Submission attempted after shutdown began
    #[error("Runtime is shutting down")]
    ShutDown,

    /// Reclaim called while the unit was still doing work
    #[error("Unit {0} reclaimed before its work finished")]
    ReclaimPending(UnitId),

    /// Reclaim called twice on the same handle
    #[error("Unit {0} was already reclaimed")]
    AlreadyReclaimed(UnitId),

    /// Reclaimed unit has a different concrete type than the handle
    #[error("Unit {0} has an unexpected type")]
    TypeMismatch(UnitId),

    /// Process-wide runtime used before `global::init`
    #[error("Runtime not initialized")]
    NotInitialized,

    /// `global::init` called twice
    #[error("Runtime already initialized")]
    AlreadyInitialized,

    /// Metrics recorder could not be installed
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl EngineError {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfig(msg.into())
    }

    /// Whether this error is a defect in the caller rather than a runtime condition
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            EngineError::ReclaimPending(_)
                | EngineError::AlreadyReclaimed(_)
                | EngineError::TypeMismatch(_)
                | EngineError::ConfigFrozen
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ReclaimPending(UnitId::from_raw(7));
        assert_eq!(err.to_string(), "Unit #7 reclaimed before its work finished");

        let err = EngineError::invalid_config("workers exceed max_workers");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: workers exceed max_workers"
        );
    }

    #[test]
    fn test_misuse_classification() {
        assert!(EngineError::ReclaimPending(UnitId::from_raw(1)).is_misuse());
        assert!(EngineError::ConfigFrozen.is_misuse());
        assert!(!EngineError::ShutDown.is_misuse());
        assert!(!EngineError::QueueClosed.is_misuse());
    }
}
