// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fleetward-core.
//!
//! Every error carries a stable code (for status reporting) and a class that
//! tells callers and the scheduler whether retrying can help.

use thiserror::Error;

/// Result type using the engine [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient condition; the same request may succeed later.
    Retryable,
    /// Retrying the same request will not help.
    Fatal,
}

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A lock was requested without waiting and is already held.
    #[error("Resource '{resource}' is busy")]
    Busy {
        /// Identity of the locked resource.
        resource: String,
    },

    /// A queue is at its configured capacity.
    #[error("Queue for work area '{work_area}' is full (capacity {capacity})")]
    Full {
        /// Work area whose queue rejected the task.
        work_area: String,
        /// Configured capacity.
        capacity: usize,
    },

    /// The durable backing of an entity no longer exists.
    #[error("Entity '{handle}' has been deleted")]
    Deleted {
        /// Durable handle of the entity.
        handle: String,
    },

    /// Durable storage I/O failed.
    #[error("Store failure during '{operation}': {details}")]
    StoreFailure {
        /// Store operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// An optimistic save detected a concurrent modification.
    #[error("Conflict saving '{handle}': expected revision {expected}, found {actual}")]
    Conflict {
        /// Durable handle of the entity.
        handle: String,
        /// Revision the caller based its change on.
        expected: i64,
        /// Revision currently stored.
        actual: i64,
    },

    /// An entity was registered with the persistence mapper twice.
    #[error("Entity '{handle}' is already registered")]
    AlreadyRegistered {
        /// Durable handle of the entity.
        handle: String,
    },

    /// A task was addressed to a work area the processor does not know.
    #[error("Unknown work area '{0}'")]
    UnknownWorkArea(String),

    /// The processor or work area no longer accepts ordinary tasks.
    #[error("Work area '{0}' is shutting down")]
    ShuttingDown(String),

    /// The device protocol collaborator reported a failure.
    #[error("Protocol error for '{target}': {message}")]
    Protocol {
        /// Device or domain the request was sent to.
        target: String,
        /// Error details.
        message: String,
    },

    /// A bounded wait elapsed.
    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// Deadline in seconds.
        seconds: u64,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A background task panicked while executing.
    #[error("Task '{0}' panicked")]
    TaskPanicked(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Convenience constructor for store failures.
    pub fn store(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::StoreFailure {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Convenience constructor for protocol failures.
    pub fn protocol(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Stable code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Busy { .. } => "BUSY",
            Self::Full { .. } => "FULL",
            Self::Deleted { .. } => "DELETED",
            Self::StoreFailure { .. } => "STORE_FAILURE",
            Self::Conflict { .. } => "CONFLICT",
            Self::AlreadyRegistered { .. } => "ALREADY_REGISTERED",
            Self::UnknownWorkArea(_) => "UNKNOWN_WORK_AREA",
            Self::ShuttingDown(_) => "SHUTTING_DOWN",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::TaskPanicked(_) => "TASK_PANICKED",
            Self::Other(_) => "OTHER",
        }
    }

    /// Retryable or fatal.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Busy { .. }
            | Self::Full { .. }
            | Self::StoreFailure { .. }
            | Self::Protocol { .. }
            | Self::Timeout { .. } => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `class() == ErrorClass::Retryable`.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// True for [`Error::Deleted`].
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StoreFailure {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                Error::Busy {
                    resource: "device:a".to_string(),
                },
                "BUSY",
            ),
            (
                Error::Full {
                    work_area: "manager".to_string(),
                    capacity: 4,
                },
                "FULL",
            ),
            (
                Error::Deleted {
                    handle: "h-1".to_string(),
                },
                "DELETED",
            ),
            (Error::store("insert", "disk full"), "STORE_FAILURE"),
            (
                Error::Conflict {
                    handle: "h-1".to_string(),
                    expected: 1,
                    actual: 2,
                },
                "CONFLICT",
            ),
            (Error::ShuttingDown("ms1".to_string()), "SHUTTING_DOWN"),
            (Error::protocol("dev", "refused"), "PROTOCOL_ERROR"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_class() {
        assert!(
            Error::Busy {
                resource: "x".to_string()
            }
            .is_retryable()
        );
        assert!(
            Error::Full {
                work_area: "x".to_string(),
                capacity: 1
            }
            .is_retryable()
        );
        assert!(Error::store("get", "io").is_retryable());
        assert_eq!(
            Error::Deleted {
                handle: "x".to_string()
            }
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            Error::Conflict {
                handle: "x".to_string(),
                expected: 1,
                actual: 3
            }
            .class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::Deleted {
            handle: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "Entity 'abc-123' has been deleted");

        let err = Error::Full {
            work_area: "managed-set:edge".to_string(),
            capacity: 2,
        };
        assert_eq!(
            err.to_string(),
            "Queue for work area 'managed-set:edge' is full (capacity 2)"
        );
    }
}
