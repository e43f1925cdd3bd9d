//! Subscriber Error Types

use crate::broker::api::BrokerError;
use crate::core::retry::RetryError;

/// Failure of the consumer itself
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscribeError {
    #[error("Pull from {subscription} failed: {source}")]
    Pull {
        subscription: String,
        source: BrokerError,
    },

    #[error("Synchronous pull from {subscription} failed: {source}")]
    SyncPull {
        subscription: String,
        source: RetryError,
    },

    #[error("Acknowledge on {subscription} failed: {source}")]
    Acknowledge {
        subscription: String,
        source: BrokerError,
    },
}

impl crate::core::error_handling::ContextualError for SubscribeError {
    fn is_user_actionable(&self) -> bool {
        false
    }

    fn user_message(&self) -> Option<&str> {
        None
    }
}

/// Result type for consumer operations
pub type SubscribeResult<T> = Result<T, SubscribeError>;

/// Processing failure reported by a message handler
///
/// Causes the message to be abandoned, never acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error("worker cancelled")]
    Cancelled,
}

impl WorkerError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkerError::Failed(message.into())
    }
}
