//! Error types for KyroCEP.
//!
//! All errors are strongly typed using thiserror. Construction-time errors are
//! raised while compiling a pattern tree; execution errors surface from event
//! delivery and from the threaded runtime.

use thiserror::Error;

/// Validation errors raised while compiling a pattern tree.
///
/// The messages are surfaced verbatim to end users, so the wording of every
/// variant is part of the external contract.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Incorrect range specification, a bounds value of zero or negative value is not allowed")]
    NonPositiveBound,

    #[error("Incorrect range specification, lower bounds value '{lower}' is higher then higher bounds '{upper}'")]
    InvertedBounds {
        lower: i64,
        upper: i64,
    },

    #[error("Variable bounds repeat operator requires an until-expression")]
    RangeWithoutUntil,

    #[error("Match-until bounds value expressions must return a numeric value")]
    NonNumericBound,

    #[error("Match-until bounds value expression refers to tag '{tag}' which is not bound before the repeat")]
    UnboundBoundTag {
        tag: String,
    },

    #[error("Variable '{name}' of type {expected} cannot be assigned a value of type {actual}")]
    VariableTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Tag '{tag}' for event '{event_type}' has already been declared for events of type {previous_type}")]
    DuplicateTag {
        tag: String,
        event_type: String,
        previous_type: String,
    },

    #[error("Tag '{tag}' for event '{event_type}' used in the repeat-until operator cannot also appear in other filter expressions")]
    RepeatTagReused {
        tag: String,
        event_type: String,
    },

    #[error("Failed to validate filter expression for event '{event_type}': tag '{tag}' is not valid in any stream")]
    UnboundTagReference {
        tag: String,
        event_type: String,
    },

    #[error("The {operator} operator requires at least {required} sub-expressions")]
    MissingOperands {
        operator: &'static str,
        required: usize,
    },

    #[error("Timer interval must be a positive duration, got {millis}ms")]
    NonPositiveInterval {
        millis: i64,
    },

    #[error("Event type name cannot be empty")]
    EmptyEventType,
}

/// Error returned by a filter predicate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PredicateError {
    /// Human-readable failure reason.
    pub message: String,
}

impl PredicateError {
    /// Creates a predicate error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Execution errors raised while delivering events or running the runtime.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Filter predicate on '{event_type}' failed: {source}")]
    Predicate {
        event_type: String,
        #[source]
        source: PredicateError,
    },

    #[error("Queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Channel '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Failed to spawn worker thread '{name}': {message}")]
    WorkerSpawn {
        name: String,
        message: String,
    },
}

/// Top-level error type for KyroCEP.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CepError {
    #[error("{error} [{expression}]")]
    Pattern {
        error: ValidationError,
        expression: String,
    },

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl CepError {
    /// Creates a pattern validation error annotated with the expression text.
    #[must_use]
    pub fn pattern(error: ValidationError, expression: impl Into<String>) -> Self {
        Self::Pattern {
            error,
            expression: expression.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the validation error, if this is one.
    #[must_use]
    pub const fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Pattern { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Returns true if this is a construction-time validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Pattern { .. })
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Pattern { .. } => false, // Validation errors won't change on retry
            Self::Execution(e) => matches!(e, ExecutionError::QueueFull { .. } | ExecutionError::Timeout { .. }),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for KyroCEP operations.
pub type CepResult<T> = Result<T, CepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_messages_are_verbatim() {
        assert_eq!(
            ValidationError::NonPositiveBound.to_string(),
            "Incorrect range specification, a bounds value of zero or negative value is not allowed"
        );
        assert_eq!(
            ValidationError::InvertedBounds { lower: 10, upper: 4 }.to_string(),
            "Incorrect range specification, lower bounds value '10' is higher then higher bounds '4'"
        );
        assert_eq!(
            ValidationError::RangeWithoutUntil.to_string(),
            "Variable bounds repeat operator requires an until-expression"
        );
        assert_eq!(
            ValidationError::NonNumericBound.to_string(),
            "Match-until bounds value expressions must return a numeric value"
        );
    }

    #[test]
    fn test_pattern_error_appends_expression() {
        let err = CepError::pattern(ValidationError::RangeWithoutUntil, "[4:6] A");
        assert_eq!(
            err.to_string(),
            "Variable bounds repeat operator requires an until-expression [[4:6] A]"
        );
        assert!(err.is_validation());
        assert!(!err.is_retryable());
        assert_eq!(err.validation(), Some(&ValidationError::RangeWithoutUntil));
    }

    #[test]
    fn test_tag_messages() {
        let err = ValidationError::DuplicateTag {
            tag: "c".to_string(),
            event_type: "C".to_string(),
            previous_type: "B".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Tag 'c' for event 'C' has already been declared for events of type B"
        );

        let err = ValidationError::RepeatTagReused {
            tag: "a".to_string(),
            event_type: "A".to_string(),
        };
        assert!(err.to_string().contains("cannot also appear in other filter expressions"));
    }

    #[test]
    fn test_predicate_error_is_execution() {
        let err: CepError = ExecutionError::Predicate {
            event_type: "A".to_string(),
            source: PredicateError::new("boom"),
        }
        .into();
        assert!(err.is_execution());
        assert!(!err.is_retryable());
        let msg = format!("{err}");
        assert!(msg.contains("'A'"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_queue_full_is_retryable() {
        let err: CepError = ExecutionError::QueueFull {
            path: "worker-0".to_string(),
            capacity: 16,
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("capacity 16"));
    }

    #[test]
    fn test_internal_error() {
        let err = CepError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
