//! Common test utilities and helpers
//!
//! Event directories on disk and command contexts backed by a shared
//! in-memory broker.

use pubsub_dispatch::app::cli::config::Settings;
use pubsub_dispatch::app::commands::CommandContext;
use pubsub_dispatch::broker::api::InMemoryBroker;
use pubsub_dispatch::core::shutdown::ShutdownCoordinator;
use pubsub_dispatch::notifications::api::EventBus;
use std::path::Path;
use std::sync::Arc;

/// Write `count` JSON event files named `event-NN.json` into `dir`
pub fn write_events(dir: &Path, count: usize) {
    for i in 0..count {
        let body = format!("{{\"sequence\": {i}, \"kind\": \"test\"}}");
        std::fs::write(dir.join(format!("event-{i:02}.json")), body).unwrap();
    }
}

/// Settings suitable for fast command runs
pub fn test_settings(total_replication: usize) -> Settings {
    Settings {
        project_id: "it".to_string(),
        topic_id: "events".to_string(),
        subscription_id: "events-sub".to_string(),
        total_replication,
        max_messages: 2,
        max_latency: 0.05,
        timeout_seconds: Some(10.0),
        shutdown_grace_seconds: 1.0,
        ..Settings::default()
    }
}

/// Command context plus a typed handle on its broker for inspection
pub fn command_context(settings: Settings) -> (CommandContext, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new());
    let ctx = CommandContext {
        settings,
        broker: broker.clone(),
        events: EventBus::new(),
        shutdown: ShutdownCoordinator::new(),
    };
    (ctx, broker)
}
