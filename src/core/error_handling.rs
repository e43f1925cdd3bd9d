//! Generic error handling utilities
//!
//! Fatal-path reporting shared by the binary. Errors opt in through
//! [`ContextualError`] to say whether their message is meant for the user.

/// Trait for errors that can distinguish between user-actionable and system errors
///
/// When `is_user_actionable()` returns `true`, `user_message()` should return
/// `Some(message)`; otherwise it should return `None`.
pub trait ContextualError: std::error::Error {
    /// True if the message is something the user can act on directly
    /// (bad configuration, missing data directory, ...)
    fn is_user_actionable(&self) -> bool;

    /// The user-facing message, when [`is_user_actionable`](Self::is_user_actionable)
    fn user_message(&self) -> Option<&str>;
}

/// Log errors with appropriate detail level based on error specificity
///
/// User-actionable errors are logged with their own message; system errors
/// are logged with `operation_context` and the detail goes to debug level.
///
/// # Examples
/// ```rust,no_run
/// # use pubsub_dispatch::core::error_handling::log_error_with_context;
/// # use pubsub_dispatch::core::validation::ConfigError;
/// let err = ConfigError::invalid("ack_deadline_seconds", "must be between 10 and 600");
/// log_error_with_context(&err, "Loading configuration");
/// // Logs: "FATAL: ack_deadline_seconds must be between 10 and 600"
/// ```
pub fn log_error_with_context<E: ContextualError + std::fmt::Display + std::fmt::Debug>(
    error: &E,
    operation_context: &str,
) {
    match error.user_message() {
        Some(user_msg) if error.is_user_actionable() => log::error!("FATAL: {}", user_msg),
        _ => log::error!("FATAL: {}", operation_context),
    }
    log::debug!("DETAIL: {}", error);
    log::debug!("DEBUG_DETAILS: {:?}", error);
}
