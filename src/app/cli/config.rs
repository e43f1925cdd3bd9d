//! Settings loading
//!
//! [`Settings`] is built once at startup from, in increasing precedence:
//! built-in defaults, a TOML configuration file, environment variables and
//! command-line flags. It is validated as a whole and then converted into
//! the component settings the publisher and consumer take.

use super::args::Args;
use crate::broker::api::{SubscriptionHandle, TopicHandle};
use crate::core::retry::RetryPolicy;
use crate::core::validation::{
    require_positive, require_positive_seconds, validate_lease_timing, ConfigError, ConfigResult,
};
use crate::publisher::api::{BatchSettings, PublisherSettings};
use crate::subscriber::api::ConsumerSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const LOG_FORMATS: [&str; 3] = ["text", "ext", "json"];

/// Logging options; only the file and CLI layers set these
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
    pub format: String,
    pub file: Option<PathBuf>,
    /// `None` means decide from the terminal
    pub color: Option<bool>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
            color: None,
        }
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub project_id: String,
    pub topic_id: String,
    pub subscription_id: String,
    pub endpoint: String,
    pub max_bytes: usize,
    pub max_messages: usize,
    pub max_latency: f64,
    pub total_replication: usize,
    pub ack_deadline_seconds: u32,
    pub max_outstanding: usize,
    pub lease_tick_seconds: f64,
    pub max_lease_seconds: u64,
    pub shutdown_grace_seconds: f64,
    pub timeout_seconds: Option<f64>,
    pub logging: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_id: "test".to_string(),
            topic_id: "test".to_string(),
            subscription_id: "test".to_string(),
            endpoint: "https://test.appspot.com/push".to_string(),
            max_bytes: 1024,
            max_messages: 10,
            max_latency: 1.0,
            total_replication: 5,
            ack_deadline_seconds: 30,
            max_outstanding: 10,
            lease_tick_seconds: 10.0,
            max_lease_seconds: 3600,
            shutdown_grace_seconds: 30.0,
            timeout_seconds: None,
            logging: LogSettings::default(),
        }
    }
}

/// Keys accepted in the TOML file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    project_id: Option<String>,
    topic_id: Option<String>,
    subscription_id: Option<String>,
    endpoint: Option<String>,
    max_bytes: Option<usize>,
    max_messages: Option<usize>,
    max_latency: Option<f64>,
    total_replication: Option<usize>,
    ack_deadline_seconds: Option<u32>,
    max_outstanding: Option<usize>,
    lease_tick_seconds: Option<f64>,
    max_lease_seconds: Option<u64>,
    shutdown_grace_seconds: Option<f64>,
    timeout_seconds: Option<f64>,
    log_level: Option<String>,
    log_format: Option<String>,
    log_file: Option<PathBuf>,
    color: Option<bool>,
}

impl Settings {
    /// Resolve settings for a parsed command line
    pub async fn load(args: &Args) -> ConfigResult<Self> {
        let mut settings = Settings::default();
        if let Some(path) = config_file_path(args.config_file.as_deref())? {
            log::debug!("Loading configuration from {}", path.display());
            let file = read_config_file(&path).await?;
            settings.apply_file(file);
        }
        settings.apply_env()?;
        settings.apply_args(args);
        settings.validate()?;
        Ok(settings)
    }

    /// Parse TOML text as a configuration file and layer it over `self`
    pub fn apply_toml(&mut self, contents: &str, path: &Path) -> ConfigResult<()> {
        let file = parse_config(contents, path)?;
        self.apply_file(file);
        Ok(())
    }

    fn apply_file(&mut self, file: FileConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = file.$field { self.$field = value; })*
            };
        }
        take!(
            project_id,
            topic_id,
            subscription_id,
            endpoint,
            max_bytes,
            max_messages,
            max_latency,
            total_replication,
            ack_deadline_seconds,
            max_outstanding,
            lease_tick_seconds,
            max_lease_seconds,
            shutdown_grace_seconds,
        );
        if file.timeout_seconds.is_some() {
            self.timeout_seconds = file.timeout_seconds;
        }
        if let Some(level) = file.log_level {
            self.logging.level = level;
        }
        if let Some(format) = file.log_format {
            self.logging.format = format;
        }
        if let Some(path) = file.log_file {
            self.logging.file = Some(path);
        }
        if file.color.is_some() {
            self.logging.color = file.color;
        }
    }

    /// Layer recognised environment variables over `self`
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Some(v) = env_string("PROJECT_ID") {
            self.project_id = v;
        }
        if let Some(v) = env_string("TOPIC_ID") {
            self.topic_id = v;
        }
        if let Some(v) = env_string("SUBSCRIPTION_ID") {
            self.subscription_id = v;
        }
        if let Some(v) = env_string("ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = env_parse("MAX_BYTES_PER_BATCH", "positive integer")? {
            self.max_bytes = v;
        }
        if let Some(v) = env_parse("MAX_MESSAGES_PER_BATCH", "positive integer")? {
            self.max_messages = v;
        }
        if let Some(v) = env_parse("MAX_LATENCY_TO_PUBLISH", "number of seconds")? {
            self.max_latency = v;
        }
        if let Some(v) = env_parse("TOTAL_REPLICATION", "positive integer")? {
            self.total_replication = v;
        }
        if let Some(v) = env_parse("ACK_DEADLINE_SECONDS", "number of seconds")? {
            self.ack_deadline_seconds = v;
        }
        if let Some(v) = env_parse("MAX_OUTSTANDING_MESSAGES", "positive integer")? {
            self.max_outstanding = v;
        }
        if let Some(v) = env_parse("LEASE_TICK_SECONDS", "number of seconds")? {
            self.lease_tick_seconds = v;
        }
        if let Some(v) = env_parse("MAX_LEASE_SECONDS", "number of seconds")? {
            self.max_lease_seconds = v;
        }
        if let Some(v) = env_parse("SHUTDOWN_GRACE_SECONDS", "number of seconds")? {
            self.shutdown_grace_seconds = v;
        }
        if let Some(v) = env_parse("TIMEOUT_SECONDS", "number of seconds")? {
            self.timeout_seconds = Some(v);
        }
        Ok(())
    }

    /// Layer command-line flags over `self`
    pub fn apply_args(&mut self, args: &Args) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = args.$field.clone() { self.$field = value; })*
            };
        }
        take!(
            project_id,
            topic_id,
            subscription_id,
            endpoint,
            max_bytes,
            max_messages,
            max_latency,
            total_replication,
            ack_deadline_seconds,
            max_outstanding,
            lease_tick_seconds,
            max_lease_seconds,
            shutdown_grace_seconds,
        );
        if args.timeout_seconds.is_some() {
            self.timeout_seconds = args.timeout_seconds;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(format) = &args.log_format {
            self.logging.format = format.clone();
        }
        if args.log_file.is_some() {
            self.logging.file = args.log_file_path().cloned();
        }
        if let Some(color) = args.color_override() {
            self.logging.color = Some(color);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        require_positive("max_bytes", self.max_bytes)?;
        require_positive("max_messages", self.max_messages)?;
        require_positive_seconds("max_latency", self.max_latency)?;
        require_positive("total_replication", self.total_replication)?;
        require_positive("max_outstanding", self.max_outstanding)?;
        validate_lease_timing(
            self.ack_deadline_seconds,
            self.lease_tick_seconds,
            self.max_lease_seconds,
        )?;
        if !self.shutdown_grace_seconds.is_finite() || self.shutdown_grace_seconds < 0.0 {
            return Err(ConfigError::invalid(
                "shutdown_grace_seconds",
                &format!(
                    "must be zero or a positive number of seconds (got {})",
                    self.shutdown_grace_seconds
                ),
            ));
        }
        if let Some(timeout) = self.timeout_seconds {
            require_positive_seconds("timeout_seconds", timeout)?;
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::invalid(
                "log_format",
                &format!("must be one of {} (got {})", LOG_FORMATS.join(", "), self.logging.format),
            ));
        }
        Ok(())
    }

    pub fn topic_handle(&self) -> TopicHandle {
        TopicHandle::new(&self.project_id, &self.topic_id)
    }

    pub fn subscription_handle(&self) -> SubscriptionHandle {
        SubscriptionHandle::new(&self.project_id, &self.subscription_id)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(seconds)
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            max_bytes: self.max_bytes,
            max_messages: self.max_messages,
            max_latency: seconds(self.max_latency),
        }
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            batch: self.batch_settings(),
            retry: RetryPolicy::default(),
            timeout: self.timeout(),
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_outstanding: self.max_outstanding,
            pull_batch_size: self.max_outstanding,
            ack_deadline_seconds: self.ack_deadline_seconds,
            lease_tick: seconds(self.lease_tick_seconds),
            max_lease: Duration::from_secs(self.max_lease_seconds),
            shutdown_grace: seconds(self.shutdown_grace_seconds),
            ..ConsumerSettings::default()
        }
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("PubsubDispatch").join("pubsub-dispatch.toml"))
}

/// The file to load: an explicit path must exist, the default one may not
fn config_file_path(explicit: Option<&Path>) -> ConfigResult<Option<PathBuf>> {
    match explicit {
        Some(path) if path.exists() => Ok(Some(path.to_path_buf())),
        Some(path) => Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
            message: format!(
                "The specified configuration file does not exist: {}",
                path.display()
            ),
        }),
        None => Ok(default_config_path().filter(|path| path.exists())),
    }
}

async fn read_config_file(path: &Path) -> ConfigResult<FileConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            message: format!("Error reading configuration file {}: {}", path.display(), source),
            source,
        })?;
    parse_config(&contents, path)
}

fn parse_config(contents: &str, path: &Path) -> ConfigResult<FileConfig> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        message: format!("Error parsing configuration file {}: {}", path.display(), source),
        source: Some(source),
    })
}

fn env_string(variable: &str) -> Option<String> {
    std::env::var(variable).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(variable: &str, expected: &str) -> ConfigResult<Option<T>> {
    match env_string(variable) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid_env(variable, &value, expected)),
    }
}

// Validated values are finite and non-negative; anything else maps to zero
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
