//! Error taxonomy for the eventflow runtime.
//!
//! Every failure surfaced to a caller is a typed [`EngineError`] variant with
//! a stable, documentable [`code`](EngineError::code). Retry eligibility is a
//! property of the error value ([`is_retryable`](EngineError::is_retryable)),
//! consumed by the retry policy rather than inferred from message text.

use serde::{Deserialize, Serialize};

/// Result type for all runtime operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Kind of message a bus failed to route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Command,
    Query,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Query => write!(f, "query"),
        }
    }
}

/// Classification of a transient storage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransientKind {
    Deadlock,
    LockTimeout,
    ConnectionReset,
    Other,
}

/// Field-level detail attached to a validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error types for all eventflow operations
#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    #[error("concurrency conflict on aggregate {aggregate_id}: expected version {expected}, stored version {actual}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("aggregate not found: {aggregate_id}")]
    AggregateNotFound { aggregate_id: String },

    #[error("no handler registered for {kind} type '{message_type}'")]
    HandlerNotFound {
        kind: MessageKind,
        message_type: String,
    },

    #[error("validation failed for '{message_type}' ({} field error(s))", fields.len())]
    ValidationFailure {
        message_type: String,
        fields: Vec<FieldError>,
    },

    #[error("authorization denied for '{message_type}': {reason}")]
    AuthorizationFailure {
        message_type: String,
        reason: String,
    },

    #[error("transient storage error during {operation}: {message}")]
    TransientStorage {
        kind: TransientKind,
        operation: String,
        message: String,
    },

    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("snapshot integrity check failed for aggregate {aggregate_id} at version {version}")]
    SnapshotIntegrity { aggregate_id: String, version: i64 },

    #[error("projection '{projection}' failed: {message}")]
    Projection { projection: String, message: String },

    #[error("saga {saga_id} failed: {message}")]
    Saga { saga_id: String, message: String },

    #[error("circuit breaker open for '{scope}'")]
    CircuitBreakerOpen { scope: String },

    #[error("command '{command_type}' timed out after {timeout_ms}ms")]
    CommandTimeout {
        command_type: String,
        timeout_ms: u64,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl EngineError {
    /// Stable error code for logs, metrics, and API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ConcurrencyConflict { .. } => "concurrency_conflict",
            EngineError::AggregateNotFound { .. } => "aggregate_not_found",
            EngineError::HandlerNotFound { .. } => "handler_not_found",
            EngineError::ValidationFailure { .. } => "validation_failure",
            EngineError::AuthorizationFailure { .. } => "authorization_failure",
            EngineError::TransientStorage { .. } => "transient_storage",
            EngineError::Storage { .. } => "storage",
            EngineError::SnapshotIntegrity { .. } => "snapshot_integrity",
            EngineError::Projection { .. } => "projection",
            EngineError::Saga { .. } => "saga",
            EngineError::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            EngineError::CommandTimeout { .. } => "command_timeout",
            EngineError::Serialization { .. } => "serialization",
            EngineError::Configuration { .. } => "configuration",
        }
    }

    /// Whether a retry policy may re-attempt the failed operation.
    ///
    /// Only transient storage failures qualify. Validation, authorization,
    /// and concurrency conflicts are surfaced to the caller, which decides
    /// whether to reload and retry at a higher level. A timed-out dispatch
    /// is not retryable either: the handler is never forcibly interrupted,
    /// so the original attempt may still be executing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStorage { .. })
    }

    /// Whether this error is a storage-level deadlock.
    pub fn is_deadlock(&self) -> bool {
        matches!(
            self,
            EngineError::TransientStorage {
                kind: TransientKind::Deadlock,
                ..
            }
        )
    }

    /// Shorthand for a transient storage error.
    pub fn transient(
        kind: TransientKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::TransientStorage {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a non-transient storage error.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_is_limited_to_transient_storage() {
        let transient = EngineError::transient(TransientKind::Deadlock, "append", "deadlock");
        assert!(transient.is_retryable());
        assert!(transient.is_deadlock());

        let conflict = EngineError::ConcurrencyConflict {
            aggregate_id: "U-1".to_string(),
            expected: 5,
            actual: 6,
        };
        assert!(!conflict.is_retryable());

        let validation = EngineError::ValidationFailure {
            message_type: "RegisterUser".to_string(),
            fields: vec![FieldError::new("email", "must not be empty")],
        };
        assert!(!validation.is_retryable());

        // The original attempt may still be running after a timeout
        let timeout = EngineError::CommandTimeout {
            command_type: "RegisterUser".to_string(),
            timeout_ms: 250,
        };
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_codes_are_stable() {
        let err = EngineError::AggregateNotFound {
            aggregate_id: "U-404".to_string(),
        };
        assert_eq!(err.code(), "aggregate_not_found");

        let err = EngineError::CommandTimeout {
            command_type: "UpdateUser".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(err.code(), "command_timeout");
    }

    #[test]
    fn test_serde_errors_map_to_serialization() {
        let bad = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: EngineError = bad.into();
        assert_eq!(err.code(), "serialization");
    }
}
