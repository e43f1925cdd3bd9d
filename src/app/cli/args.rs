//! Command-line arguments
//!
//! Every configuration key has a flag here; a flag that is given wins over
//! the environment, the TOML file and the built-in default (see
//! [`Settings::load`](super::config::Settings::load)).

use crate::core::version::long_version;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pubsub-dispatch")]
#[command(about = "Batching publisher and lease-managed consumer for a message broker")]
#[command(version, long_version = long_version())]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config-file", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Force coloured output
    #[arg(long = "color", conflicts_with = "no_color", global = true)]
    pub color: bool,

    /// Disable coloured output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", global = true,
          value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", global = true,
          value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,

    /// Log file path (use 'none' to disable file logging)
    #[arg(short = 'f', long = "log-file", value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// More log output (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Less log output (repeatable)
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    /// Project that owns the topic and subscription
    #[arg(long = "project-id", value_name = "ID", global = true)]
    pub project_id: Option<String>,

    /// Topic to publish to
    #[arg(long = "topic-id", value_name = "ID", global = true)]
    pub topic_id: Option<String>,

    /// Subscription to consume from
    #[arg(long = "subscription-id", value_name = "ID", global = true)]
    pub subscription_id: Option<String>,

    /// Push endpoint URL for push subscriptions
    #[arg(long = "endpoint", value_name = "URL", global = true)]
    pub endpoint: Option<String>,

    /// Flush a batch once it holds this many bytes
    #[arg(long = "max-bytes", value_name = "BYTES", global = true)]
    pub max_bytes: Option<usize>,

    /// Flush a batch once it holds this many messages
    #[arg(long = "max-messages", value_name = "COUNT", global = true)]
    pub max_messages: Option<usize>,

    /// Flush a batch once its oldest message is this old
    #[arg(long = "max-latency", value_name = "SECONDS", global = true)]
    pub max_latency: Option<f64>,

    /// Number of times the full message list is published
    #[arg(long = "total-replication", value_name = "COUNT", global = true)]
    pub total_replication: Option<usize>,

    /// Ack deadline requested for subscriptions (10-600)
    #[arg(long = "ack-deadline", value_name = "SECONDS", global = true)]
    pub ack_deadline_seconds: Option<u32>,

    /// Most messages processed at once
    #[arg(long = "max-outstanding", value_name = "COUNT", global = true)]
    pub max_outstanding: Option<usize>,

    /// Interval between lease extensions
    #[arg(long = "lease-tick", value_name = "SECONDS", global = true)]
    pub lease_tick_seconds: Option<f64>,

    /// Stop extending a lease after this long
    #[arg(long = "max-lease", value_name = "SECONDS", global = true)]
    pub max_lease_seconds: Option<u64>,

    /// Time allowed for in-flight messages when stopping
    #[arg(long = "shutdown-grace", value_name = "SECONDS", global = true)]
    pub shutdown_grace_seconds: Option<f64>,

    /// Stop publishing or consuming after this long
    #[arg(short = 't', long = "timeout", value_name = "SECONDS", global = true)]
    pub timeout_seconds: Option<f64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Publish every JSON event in a directory
    Publish {
        /// Directory containing *.json event files
        #[arg(short = 'd', long = "data-dir", value_name = "DIR")]
        data_dir: PathBuf,

        /// Override total-replication for this run
        #[arg(short = 'n', long = "replication", value_name = "COUNT")]
        replication: Option<usize>,
    },

    /// Create topic and subscription, publish, then consume with lease management
    Relay {
        /// Directory containing *.json event files
        #[arg(short = 'd', long = "data-dir", value_name = "DIR")]
        data_dir: PathBuf,

        /// Create a push subscription to this endpoint instead of consuming
        #[arg(long = "push-endpoint", value_name = "URL")]
        push_endpoint: Option<String>,
    },

    /// Publish, then drain the subscription with synchronous pulls
    SyncPull {
        /// Directory containing *.json event files
        #[arg(short = 'd', long = "data-dir", value_name = "DIR")]
        data_dir: PathBuf,

        /// Messages requested per pull
        #[arg(short = 'm', long = "pull-size", value_name = "COUNT", default_value_t = 10)]
        pull_size: usize,
    },

    /// Apply example IAM bindings and report policies and permissions
    Policy,
}

impl Args {
    /// Effective colour choice; `None` means decide from the terminal
    pub fn color_override(&self) -> Option<bool> {
        match (self.color, self.no_color) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    /// Log file, with the magic values `none` and `-` meaning no file
    pub fn log_file_path(&self) -> Option<&PathBuf> {
        self.log_file.as_ref().filter(|path| {
            let text = path.to_string_lossy();
            !(text.eq_ignore_ascii_case("none") || text == "-")
        })
    }
}
