//! Test Helper Functions
//!
//! Shared utilities for consumer tests

use crate::broker::api::{
    BrokerClient, InMemoryBroker, PubsubMessage, SubscriptionHandle, SubscriptionKind,
    TopicHandle,
};
use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::EventBus;
use crate::subscriber::api::{Consumer, ConsumerSettings, InboundMessage};
use std::sync::Arc;
use std::time::Duration;

pub struct ConsumerFixture {
    pub broker: Arc<InMemoryBroker>,
    pub topic: TopicHandle,
    pub subscription: SubscriptionHandle,
    pub events: EventBus,
    pub shutdown: ShutdownCoordinator,
}

/// Broker with one topic and one pull subscription using a 30s ack deadline
pub async fn consumer_fixture() -> ConsumerFixture {
    let broker = Arc::new(InMemoryBroker::new());
    let topic = broker.create_topic("test", "events").await.unwrap();
    let subscription = broker
        .create_subscription("test", "events-sub", &topic, SubscriptionKind::Pull, 30)
        .await
        .unwrap();

    ConsumerFixture {
        broker,
        topic,
        subscription,
        events: EventBus::new(),
        shutdown: ShutdownCoordinator::new(),
    }
}

impl ConsumerFixture {
    pub async fn publish(&self, count: usize) {
        let messages = (0..count)
            .map(|i| PubsubMessage {
                data: format!("event-{i}").into_bytes(),
                attributes: [("index".to_string(), i.to_string())].into(),
            })
            .collect();
        self.broker.publish(&self.topic, messages).await.unwrap();
    }

    /// Pull directly from the broker, bypassing any consumer
    pub async fn pull_inbound(&self, max_messages: usize) -> Vec<InboundMessage> {
        self.broker
            .pull(&self.subscription, max_messages)
            .await
            .unwrap()
            .into_iter()
            .map(|received| InboundMessage::from_received(received, Duration::from_secs(30)))
            .collect()
    }

    pub fn consumer(&self, settings: ConsumerSettings) -> Consumer {
        Consumer::new(
            self.broker.clone(),
            self.subscription.clone(),
            settings,
            self.events.clone(),
        )
        .unwrap()
    }
}

pub fn consumer_settings(max_outstanding: usize, shutdown_grace: Duration) -> ConsumerSettings {
    ConsumerSettings {
        max_outstanding,
        shutdown_grace,
        ..ConsumerSettings::default()
    }
}
