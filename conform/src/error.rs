//! Engine error types
//!
//! Device failures are normally converted into outcome records at the member
//! that produced them. `ConformError` is what a test step returns when it has
//! to stop early: the run was cancelled, a wait timed out, a device call the
//! step depended on failed, or the engine itself hit something unexpected.

use crate::device::{DeviceError, ErrorKind};
use thiserror::Error;

/// Result type for engine steps
pub type ConformResult<T> = Result<T, ConformError>;

#[derive(Error, Debug, Clone)]
pub enum ConformError {
    /// The cooperative cancellation flag was raised
    #[error("Conformance run cancelled")]
    Cancelled,

    /// An async completion wait did not finish in time
    #[error("Timeout: {operation} did not complete within {seconds:.1}s")]
    Timeout {
        operation: String,
        seconds: f64,
    },

    /// A device call the step could not do without failed
    #[error("{member} failed: {source}")]
    Device {
        member: String,
        #[source]
        source: DeviceError,
    },

    /// Settings were rejected before the run started
    #[error("Invalid settings: {0}")]
    Settings(String),

    /// Unexpected failure inside the engine itself
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConformError {
    pub fn device(member: impl Into<String>, source: DeviceError) -> Self {
        ConformError::Device {
            member: member.into(),
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: f64) -> Self {
        ConformError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConformError::Cancelled)
    }

    /// Kind of the underlying device error, if this wraps one
    pub fn device_kind(&self) -> Option<ErrorKind> {
        match self {
            ConformError::Device { source, .. } => Some(source.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_is_wrapped_with_member() {
        let err = ConformError::device("Slewing", DeviceError::not_implemented("Slewing"));
        assert_eq!(err.device_kind(), Some(ErrorKind::NotImplemented));
        assert_eq!(err.to_string(), "Slewing failed: NotImplemented: Slewing is not implemented");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_timeout_display() {
        let err = ConformError::timeout("SlewToCoordinatesAsync", 300.0);
        assert_eq!(
            err.to_string(),
            "Timeout: SlewToCoordinatesAsync did not complete within 300.0s"
        );
        assert_eq!(err.device_kind(), None);
    }
}
