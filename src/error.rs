//! Error types for evq.

use thiserror::Error;

/// Main error type for evq.
#[derive(Error, Debug)]
#[allow(dead_code)]
pub enum EvqError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to schedule phase call: {0}")]
    Scheduling(String),

    #[error("Out-of-order finalize completion from worker {got} ({expected})")]
    OrderingViolation { got: u32, expected: String },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Shared queue error: {0}")]
    Queue(String),

    #[error("Shared memory error: {0}")]
    Shm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<nix::errno::Errno> for EvqError {
    fn from(e: nix::errno::Errno) -> Self {
        EvqError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

/// Result type alias for evq operations.
pub type Result<T> = std::result::Result<T, EvqError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_message() {
        let err = EvqError::Config("worker count must be positive".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("worker count"));
    }

    #[test]
    fn test_ordering_violation_message() {
        let err = EvqError::OrderingViolation {
            got: 3,
            expected: "expected worker 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("worker 3"));
        assert!(msg.contains("expected worker 1"));
    }

    #[test]
    fn test_scheduling_error_message() {
        let err = EvqError::Scheduling("worker 2 already exited".to_string());
        let msg = err.to_string();
        assert!(msg.contains("schedule"));
        assert!(msg.contains("worker 2"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: EvqError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_errno_conversion() {
        let err: EvqError = nix::errno::Errno::ENOENT.into();
        assert!(matches!(err, EvqError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: EvqError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<()> {
            Err(EvqError::Queue("full".to_string()))
        }
        assert!(returns_err().is_err());
    }
}
