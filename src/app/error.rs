//! Application Error Types

use crate::app::data_files::DataFileError;
use crate::broker::api::BrokerError;
use crate::core::error_handling::ContextualError;
use crate::core::validation::ConfigError;
use crate::publisher::api::PublishError;
use crate::subscriber::api::SubscribeError;

/// Process exit code for configuration errors
pub const EXIT_CONFIG: i32 = 2;
/// Process exit code for every other failure
pub const EXIT_FAILURE: i32 = 1;

/// Failure of a command
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    DataFile(#[from] DataFileError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error("Logging setup failed: {message}")]
    Logging { message: String },
}

impl AppError {
    /// Only configuration errors are fatal at startup with their own code
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        }
    }
}

impl ContextualError for AppError {
    fn is_user_actionable(&self) -> bool {
        match self {
            AppError::Config(e) => e.is_user_actionable(),
            AppError::DataFile(e) => e.is_user_actionable(),
            AppError::Broker(e) => e.is_user_actionable(),
            AppError::Publish(e) => e.is_user_actionable(),
            AppError::Subscribe(e) => e.is_user_actionable(),
            AppError::Logging { .. } => true,
        }
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            AppError::Config(e) => e.user_message(),
            AppError::DataFile(e) => e.user_message(),
            AppError::Broker(e) => e.user_message(),
            AppError::Publish(e) => e.user_message(),
            AppError::Subscribe(e) => e.user_message(),
            AppError::Logging { message } => Some(message),
        }
    }
}

/// Result type for commands
pub type AppResult<T> = Result<T, AppError>;
