//! Configuration validation
//!
//! [`ConfigError`] is the only error class that is fatal at process level.
//! The helpers here are shared by the settings loader and by component
//! constructors that validate their own settings.

use crate::broker::api::{MAX_ACK_DEADLINE_SECONDS, MIN_ACK_DEADLINE_SECONDS};
use std::path::PathBuf;

/// Invalid or unreadable configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{message}")]
    Invalid { key: String, message: String },

    #[error("{message}")]
    InvalidEnvironment { variable: String, message: String },

    #[error("{message}")]
    FileNotFound { path: PathBuf, message: String },

    #[error("{message}")]
    Parse {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    #[error("{message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// A key whose value is out of range
    pub fn invalid(key: &str, problem: &str) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: format!("{key} {problem}"),
        }
    }

    /// An environment variable whose value cannot be parsed
    pub fn invalid_env(variable: &str, value: &str, expected: &str) -> Self {
        ConfigError::InvalidEnvironment {
            variable: variable.to_string(),
            message: format!(
                "Environment variable {variable}='{value}' is not a valid {expected}"
            ),
        }
    }

    /// Name of the offending key or variable, when known
    pub fn key(&self) -> Option<&str> {
        match self {
            ConfigError::Invalid { key, .. } => Some(key),
            ConfigError::InvalidEnvironment { variable, .. } => Some(variable),
            _ => None,
        }
    }

    fn message(&self) -> &str {
        match self {
            ConfigError::Invalid { message, .. }
            | ConfigError::InvalidEnvironment { message, .. }
            | ConfigError::FileNotFound { message, .. }
            | ConfigError::Parse { message, .. }
            | ConfigError::Io { message, .. } => message,
        }
    }
}

impl crate::core::error_handling::ContextualError for ConfigError {
    fn is_user_actionable(&self) -> bool {
        true
    }

    fn user_message(&self) -> Option<&str> {
        Some(self.message())
    }
}

/// Result type for configuration loading and validation
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Reject zero for a count or size bound
pub fn require_positive(key: &str, value: usize) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::invalid(key, "must be at least 1"));
    }
    Ok(())
}

/// Reject non-finite, zero or negative durations given in seconds
pub fn require_positive_seconds(key: &str, value: f64) -> ConfigResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::invalid(
            key,
            &format!("must be a positive number of seconds (got {value})"),
        ));
    }
    Ok(())
}

/// Ack deadline must lie within the broker's accepted range
pub fn validate_ack_deadline(seconds: u32) -> ConfigResult<()> {
    if !(MIN_ACK_DEADLINE_SECONDS..=MAX_ACK_DEADLINE_SECONDS).contains(&seconds) {
        return Err(ConfigError::invalid(
            "ack_deadline_seconds",
            &format!(
                "must be between {} and {} (got {})",
                MIN_ACK_DEADLINE_SECONDS, MAX_ACK_DEADLINE_SECONDS, seconds
            ),
        ));
    }
    Ok(())
}

/// The extension tick must fire before the deadline it renews runs out,
/// and the maximum lease may not be shorter than a single deadline
pub fn validate_lease_timing(
    ack_deadline_seconds: u32,
    lease_tick_seconds: f64,
    max_lease_seconds: u64,
) -> ConfigResult<()> {
    validate_ack_deadline(ack_deadline_seconds)?;
    require_positive_seconds("lease_tick_seconds", lease_tick_seconds)?;
    if lease_tick_seconds >= f64::from(ack_deadline_seconds) {
        return Err(ConfigError::invalid(
            "lease_tick_seconds",
            &format!(
                "must be shorter than ack_deadline_seconds ({} >= {})",
                lease_tick_seconds, ack_deadline_seconds
            ),
        ));
    }
    if max_lease_seconds < u64::from(ack_deadline_seconds) {
        return Err(ConfigError::invalid(
            "max_lease_seconds",
            &format!(
                "must be at least ack_deadline_seconds ({} < {})",
                max_lease_seconds, ack_deadline_seconds
            ),
        ));
    }
    Ok(())
}
