//! Command implementations
//!
//! Each command works against the broker in [`CommandContext`] and returns
//! what it did, so the binary can print a summary and tests can inspect it.

use crate::app::cli::args::Command;
use crate::app::cli::config::Settings;
use crate::app::data_files::load_events;
use crate::app::error::AppResult;
use crate::broker::api::{
    BrokerClient, BrokerError, ErrorClass, IamPolicy, MessageId, SubscriptionHandle,
    SubscriptionKind, TopicHandle,
};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::sync::handle_mutex_poison;
use crate::notifications::api::EventBus;
use crate::publisher::api::{OutboundMessage, PublishSummary, Publisher};
use crate::subscriber::api::{Consumer, ConsumerReport, InboundMessage, WorkerError};
use colored::Colorize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Example bindings applied by the `policy` command
pub const EXAMPLE_BINDINGS: [(&str, &str); 2] = [
    ("roles/pubsub.viewer", "allUsers"),
    ("roles/pubsub.publisher", "group:cloud-logs@google.com"),
];

/// Permissions checked by the `policy` command
pub const TOPIC_PERMISSIONS: [&str; 3] = [
    "pubsub.topics.list",
    "pubsub.topics.publish",
    "pubsub.topics.update",
];
pub const SUBSCRIPTION_PERMISSIONS: [&str; 2] =
    ["pubsub.subscriptions.consume", "pubsub.subscriptions.update"];

/// Everything a command needs
#[derive(Clone)]
pub struct CommandContext {
    pub settings: Settings,
    pub broker: Arc<dyn BrokerClient>,
    pub events: EventBus,
    pub shutdown: ShutdownCoordinator,
}

/// Result of the `relay` command
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub subscription: SubscriptionHandle,
    pub summaries: Vec<PublishSummary>,
    /// `None` for push subscriptions, which are not consumed here
    pub consumer: Option<ConsumerReport>,
}

/// Result of the `policy` command
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub topic_policy: IamPolicy,
    pub subscription_policy: IamPolicy,
    pub topic_permissions: Vec<String>,
    pub subscription_permissions: Vec<String>,
}

/// Run the selected command
pub async fn run_command(ctx: &CommandContext, command: &Command) -> AppResult<()> {
    match command {
        Command::Publish {
            data_dir,
            replication,
        } => {
            let summaries = publish(ctx, data_dir, *replication).await?;
            print_publish_summary(&summaries);
        }
        Command::Relay {
            data_dir,
            push_endpoint,
        } => {
            let outcome = relay(ctx, data_dir, push_endpoint.as_deref()).await?;
            print_publish_summary(&outcome.summaries);
            if let Some(report) = outcome.consumer {
                print_consumer_report(&outcome.subscription, &report);
            }
        }
        Command::SyncPull {
            data_dir,
            pull_size,
        } => {
            let received = sync_pull(ctx, data_dir, *pull_size).await?;
            println!(
                "Received and acknowledged {} message(s)",
                received.len().to_string().green()
            );
        }
        Command::Policy => {
            let outcome = policy(ctx).await?;
            println!("Topic policy: {:?}", outcome.topic_policy.bindings);
            println!("Subscription policy: {:?}", outcome.subscription_policy.bindings);
            println!("Topic permissions: {}", outcome.topic_permissions.join(", "));
            println!(
                "Subscription permissions: {}",
                outcome.subscription_permissions.join(", ")
            );
        }
    }
    Ok(())
}

/// Publish every event in `data_dir`, `replication` times
pub async fn publish(
    ctx: &CommandContext,
    data_dir: &Path,
    replication: Option<usize>,
) -> AppResult<Vec<PublishSummary>> {
    let messages = load_events(data_dir).await?;
    if messages.is_empty() {
        log::warn!("No events found in {}", data_dir.display());
        return Ok(Vec::new());
    }
    let topic = ensure_topic(ctx).await?;
    publish_to(ctx, topic, &messages, replication).await
}

/// Create topic and subscription, publish, then consume until every
/// published copy has been handled once or the timeout fires
pub async fn relay(
    ctx: &CommandContext,
    data_dir: &Path,
    push_endpoint: Option<&str>,
) -> AppResult<RelayOutcome> {
    let messages = load_events(data_dir).await?;
    let topic = ensure_topic(ctx).await?;
    let subscription = ensure_subscription(ctx, &topic, push_endpoint).await?;

    let summaries = if messages.is_empty() {
        log::warn!("No events found in {}", data_dir.display());
        Vec::new()
    } else {
        publish_to(ctx, topic, &messages, None).await?
    };

    if let Some(endpoint) = push_endpoint {
        log::info!("Push subscription {} delivers to {}", subscription, endpoint);
        return Ok(RelayOutcome {
            subscription,
            summaries,
            consumer: None,
        });
    }

    let published: HashSet<MessageId> = summaries
        .iter()
        .flat_map(PublishSummary::message_ids)
        .cloned()
        .collect();
    let expected = published.len();
    let consumer = Consumer::new(
        Arc::clone(&ctx.broker),
        subscription.clone(),
        ctx.settings.consumer_settings(),
        ctx.events.clone(),
    )?;

    let report = if expected == 0 {
        ConsumerReport::default()
    } else {
        // Redeliveries and messages left over from earlier runs do not count
        let remaining = Arc::new(Mutex::new(published));
        let handler = move |message: InboundMessage, shutdown: ShutdownCoordinator| {
            let remaining = Arc::clone(&remaining);
            async move {
                log_message(&message);
                let left = {
                    let mut remaining = handle_mutex_poison(remaining.lock(), WorkerError::Failed)?;
                    remaining
                        .remove(&message.message_id)
                        .then(|| remaining.len())
                };
                if left == Some(0) {
                    log::debug!("All {} published message(s) handled", expected);
                    shutdown.trigger_shutdown();
                }
                Ok::<(), WorkerError>(())
            }
        };
        consumer
            .run_for(handler, &ctx.shutdown, ctx.settings.timeout())
            .await?
    };

    Ok(RelayOutcome {
        subscription,
        summaries,
        consumer: Some(report),
    })
}

/// Publish, then pull synchronously until the subscription is drained
pub async fn sync_pull(
    ctx: &CommandContext,
    data_dir: &Path,
    pull_size: usize,
) -> AppResult<Vec<InboundMessage>> {
    let messages = load_events(data_dir).await?;
    let topic = ensure_topic(ctx).await?;
    let subscription = ensure_subscription(ctx, &topic, None).await?;
    if !messages.is_empty() {
        publish_to(ctx, topic, &messages, None).await?;
    }

    let consumer = Consumer::new(
        Arc::clone(&ctx.broker),
        subscription,
        ctx.settings.consumer_settings(),
        ctx.events.clone(),
    )?;
    let mut received = Vec::new();
    while !ctx.shutdown.is_shutdown_requested() {
        let batch = consumer.synchronous_pull(pull_size, &ctx.shutdown).await?;
        if batch.is_empty() {
            break;
        }
        batch.iter().for_each(log_message);
        received.extend(batch);
    }
    Ok(received)
}

/// Apply the example bindings to topic and subscription and report the
/// resulting policies and permissions
pub async fn policy(ctx: &CommandContext) -> AppResult<PolicyOutcome> {
    let topic = ensure_topic(ctx).await?;
    let subscription = ensure_subscription(ctx, &topic, None).await?;

    let topic_policy = apply_bindings(ctx, &topic.path()).await?;
    let subscription_policy = apply_bindings(ctx, &subscription.path()).await?;
    log::info!("Policy for {}: {:?}", topic, topic_policy.bindings);
    log::info!("Policy for {}: {:?}", subscription, subscription_policy.bindings);

    let topic_permissions = ctx
        .broker
        .test_iam_permissions(&topic.path(), &owned(&TOPIC_PERMISSIONS))
        .await?;
    let subscription_permissions = ctx
        .broker
        .test_iam_permissions(&subscription.path(), &owned(&SUBSCRIPTION_PERMISSIONS))
        .await?;
    log::info!("Permissions on {}: {:?}", topic, topic_permissions);
    log::info!("Permissions on {}: {:?}", subscription, subscription_permissions);

    Ok(PolicyOutcome {
        topic_policy,
        subscription_policy,
        topic_permissions,
        subscription_permissions,
    })
}

async fn publish_to(
    ctx: &CommandContext,
    topic: TopicHandle,
    messages: &[OutboundMessage],
    replication: Option<usize>,
) -> AppResult<Vec<PublishSummary>> {
    let publisher = Publisher::new(
        Arc::clone(&ctx.broker),
        topic,
        ctx.settings.publisher_settings(),
        ctx.events.clone(),
        ctx.shutdown.clone(),
    )?;
    let replication = replication.unwrap_or(ctx.settings.total_replication);
    Ok(publisher.publish_all(messages, replication).await?)
}

async fn ensure_topic(ctx: &CommandContext) -> AppResult<TopicHandle> {
    let settings = &ctx.settings;
    match ctx
        .broker
        .create_topic(&settings.project_id, &settings.topic_id)
        .await
    {
        Ok(topic) => {
            log::info!("Topic created: {}", topic);
            Ok(topic)
        }
        Err(e) if e.class == ErrorClass::AlreadyExists => Ok(settings.topic_handle()),
        Err(e) => Err(e.into()),
    }
}

async fn ensure_subscription(
    ctx: &CommandContext,
    topic: &TopicHandle,
    push_endpoint: Option<&str>,
) -> AppResult<SubscriptionHandle> {
    let settings = &ctx.settings;
    let kind = match push_endpoint {
        Some(endpoint) => SubscriptionKind::Push {
            endpoint: endpoint.to_string(),
        },
        None => SubscriptionKind::Pull,
    };
    let created = ctx
        .broker
        .create_subscription(
            &settings.project_id,
            &settings.subscription_id,
            topic,
            kind,
            settings.ack_deadline_seconds,
        )
        .await;
    match created {
        Ok(subscription) => {
            log::info!("Subscription created: {}", subscription);
            Ok(subscription)
        }
        Err(e) if e.class == ErrorClass::AlreadyExists => {
            let subscription = settings.subscription_handle();
            if let Some(endpoint) = push_endpoint {
                let info = ctx
                    .broker
                    .update_push_endpoint(&subscription, endpoint)
                    .await?;
                log::info!("Push endpoint for {} updated: {:?}", subscription, info.kind);
            }
            Ok(subscription)
        }
        Err(e) => Err(e.into()),
    }
}

async fn apply_bindings(ctx: &CommandContext, resource: &str) -> Result<IamPolicy, BrokerError> {
    let mut policy = ctx.broker.get_iam_policy(resource).await?;
    for (role, member) in EXAMPLE_BINDINGS {
        policy.add_binding(role, &[member]);
    }
    ctx.broker.set_iam_policy(resource, policy).await
}

fn owned(permissions: &[&str]) -> Vec<String> {
    permissions.iter().map(|p| p.to_string()).collect()
}

fn log_message(message: &InboundMessage) {
    log::info!(
        "Received message {}: {}",
        message.message_id,
        message.payload_str()
    );
    for (key, value) in &message.attributes {
        log::info!("  {}: {}", key, value);
    }
}

fn print_publish_summary(summaries: &[PublishSummary]) {
    for (index, summary) in summaries.iter().enumerate() {
        let failed = summary.failed();
        let failed = if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        };
        let latency = summary
            .max_latency()
            .map(|l| format!("{:.3}s", l.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "Replication {}: {} published, {} failed, max latency {}",
            index + 1,
            summary.published().to_string().green(),
            failed,
            latency
        );
    }
}

fn print_consumer_report(subscription: &SubscriptionHandle, report: &ConsumerReport) {
    println!(
        "{}: {} received, {} acknowledged, {} abandoned, {} deadline extension(s)",
        subscription,
        report.received,
        report.acknowledged.to_string().green(),
        report.abandoned,
        report.extensions
    );
}
