//! Test Helper Functions
//!
//! Shared utilities for publisher tests

use crate::broker::api::{
    BrokerClient, InMemoryBroker, SubscriptionHandle, SubscriptionKind, TopicHandle,
};
use crate::core::retry::RetryPolicy;
use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::EventBus;
use crate::publisher::api::{BatchSettings, OutboundMessage, Publisher, PublisherSettings};
use std::sync::Arc;
use std::time::Duration;

pub struct PublisherFixture {
    pub broker: Arc<InMemoryBroker>,
    pub topic: TopicHandle,
    pub subscription: SubscriptionHandle,
    pub events: EventBus,
    pub shutdown: ShutdownCoordinator,
    pub publisher: Publisher,
}

/// Broker with one topic and one pull subscription, plus a publisher for the topic
pub async fn publisher_fixture(batch: BatchSettings) -> PublisherFixture {
    publisher_fixture_with(PublisherSettings {
        batch,
        retry: RetryPolicy::default(),
        timeout: None,
    })
    .await
}

pub async fn publisher_fixture_with(settings: PublisherSettings) -> PublisherFixture {
    let broker = Arc::new(InMemoryBroker::new());
    let topic = broker.create_topic("test", "events").await.unwrap();
    let subscription = broker
        .create_subscription("test", "events-sub", &topic, SubscriptionKind::Pull, 30)
        .await
        .unwrap();
    let events = EventBus::new();
    let shutdown = ShutdownCoordinator::new();
    let publisher = Publisher::new(
        broker.clone(),
        topic.clone(),
        settings,
        events.clone(),
        shutdown.clone(),
    )
    .unwrap();

    PublisherFixture {
        broker,
        topic,
        subscription,
        events,
        shutdown,
        publisher,
    }
}

pub fn batch_settings(max_bytes: usize, max_messages: usize, max_latency_ms: u64) -> BatchSettings {
    BatchSettings {
        max_bytes,
        max_messages,
        max_latency: Duration::from_millis(max_latency_ms),
    }
}

pub fn messages(count: usize) -> Vec<OutboundMessage> {
    (0..count)
        .map(|i| OutboundMessage::new(format!("event-{i}")))
        .collect()
}
