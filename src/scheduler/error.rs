//! Error types for the scheduler module

use std::fmt;

use crate::storage::StoreError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
///
/// Per-campaign failures are not errors at this level; they are reported as
/// [`RotationFailure`](super::executor::RotationFailure) values inside a tick
/// report. A `SchedulerError` means the driver itself could not proceed.
#[derive(Debug)]
pub enum SchedulerError {
    /// Cadence could not be parsed or produced an out-of-range instant
    InvalidCadence {
        reason: String,
    },

    /// Store call failed
    Store {
        operation: String,
        reason: String,
    },

    /// Store call did not finish in time
    Timeout {
        operation: String,
        secs: u64,
    },

    /// Driver or finalizer configuration error
    ConfigError {
        field: String,
        reason: String,
    },

    /// Driver loop is already running
    AlreadyRunning,

    /// Driver loop failed to run or join
    DriverFailed {
        reason: String,
    },

    /// Serialization/deserialization error
    SerializationError {
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCadence { reason } => {
                write!(f, "Invalid cadence: {}", reason)
            }
            Self::Store { operation, reason } => {
                write!(f, "Store error during '{}': {}", operation, reason)
            }
            Self::Timeout { operation, secs } => {
                write!(f, "Store call '{}' timed out after {}s", operation, secs)
            }
            Self::ConfigError { field, reason } => {
                write!(f, "Scheduler config error in '{}': {}", field, reason)
            }
            Self::AlreadyRunning => {
                write!(f, "Scheduler driver is already running")
            }
            Self::DriverFailed { reason } => {
                write!(f, "Scheduler driver failed: {}", reason)
            }
            Self::SerializationError { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        Self::Store {
            operation: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create an invalid cadence error
    pub fn invalid_cadence(reason: impl Into<String>) -> Self {
        Self::InvalidCadence {
            reason: reason.into(),
        }
    }

    /// Create a store error with context
    pub fn store(operation: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Create a store timeout error
    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs,
        }
    }

    /// Create a config error
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigError {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a driver failure error
    pub fn driver_failed(reason: impl Into<String>) -> Self {
        Self::DriverFailed {
            reason: reason.into(),
        }
    }

    /// Check if the error is recoverable
    ///
    /// Recoverable errors abort the current tick only; the next tick may
    /// succeed without intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::Timeout { .. } | Self::DriverFailed { .. }
        )
    }
}
