//! Broker Error Types

use strum_macros::{Display, EnumIter, EnumString};

/// Status class reported by the broker for a failed call
///
/// The first seven variants are the transient classes that the publish
/// retry policy is allowed to retry. Everything else is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum ErrorClass {
    Aborted,
    DeadlineExceeded,
    InternalServerError,
    ResourceExhausted,
    ServiceUnavailable,
    Unknown,
    Cancelled,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    FailedPrecondition,
}

impl ErrorClass {
    /// Whether a failure of this class may succeed if the call is repeated
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorClass::Aborted
                | ErrorClass::DeadlineExceeded
                | ErrorClass::InternalServerError
                | ErrorClass::ResourceExhausted
                | ErrorClass::ServiceUnavailable
                | ErrorClass::Unknown
                | ErrorClass::Cancelled
        )
    }
}

/// Error returned by any [`BrokerClient`](crate::broker::api::BrokerClient) call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct BrokerError {
    pub class: ErrorClass,
    pub message: String,
}

impl BrokerError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn not_found(resource: &str) -> Self {
        Self::new(ErrorClass::NotFound, format!("Resource not found: {resource}"))
    }

    pub fn already_exists(resource: &str) -> Self {
        Self::new(
            ErrorClass::AlreadyExists,
            format!("Resource already exists: {resource}"),
        )
    }

    pub fn is_transient(&self) -> bool {
        self.class.is_transient()
    }
}

impl crate::core::error_handling::ContextualError for BrokerError {
    fn is_user_actionable(&self) -> bool {
        matches!(
            self.class,
            ErrorClass::NotFound
                | ErrorClass::AlreadyExists
                | ErrorClass::PermissionDenied
                | ErrorClass::Unauthenticated
        )
    }

    fn user_message(&self) -> Option<&str> {
        if self.is_user_actionable() {
            Some(&self.message)
        } else {
            None
        }
    }
}

/// Result type for broker calls
pub type BrokerResult<T> = Result<T, BrokerError>;
