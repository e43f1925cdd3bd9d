//! Publisher Error Types

use crate::broker::api::BrokerError;
use crate::core::retry::RetryError;
use std::time::Duration;

/// Why a message was not published
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("Publish rejected after {attempts} attempt(s): {source}")]
    Permanent { source: BrokerError, attempts: u32 },

    #[error("Publish gave up after {attempts} attempt(s), retry deadline of {deadline:?} exceeded: {last}")]
    DeadlineExceeded {
        #[source]
        last: BrokerError,
        attempts: u32,
        deadline: Duration,
    },

    #[error("Publish cancelled after {attempts} attempt(s): {last}")]
    Cancelled {
        #[source]
        last: BrokerError,
        attempts: u32,
    },

    #[error("Publisher internal error: {message}")]
    Internal { message: String },

    #[error("Publish task ended without reporting a result")]
    Dropped,
}

impl PublishError {
    pub fn internal(message: impl Into<String>) -> Self {
        PublishError::Internal {
            message: message.into(),
        }
    }

    /// Whether re-submitting the message later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Permanent { .. } => false,
            PublishError::DeadlineExceeded { .. } | PublishError::Cancelled { .. } => true,
            PublishError::Internal { .. } | PublishError::Dropped => true,
        }
    }
}

impl From<RetryError> for PublishError {
    fn from(error: RetryError) -> Self {
        match error {
            RetryError::Permanent {
                source, attempts, ..
            } => PublishError::Permanent { source, attempts },
            RetryError::DeadlineExceeded {
                last,
                attempts,
                deadline,
                ..
            } => PublishError::DeadlineExceeded {
                last,
                attempts,
                deadline,
            },
            RetryError::Cancelled { last, attempts, .. } => {
                PublishError::Cancelled { last, attempts }
            }
        }
    }
}

impl crate::core::error_handling::ContextualError for PublishError {
    fn is_user_actionable(&self) -> bool {
        false
    }

    fn user_message(&self) -> Option<&str> {
        None
    }
}

/// Result type for publisher operations
pub type PublishResult<T> = Result<T, PublishError>;
