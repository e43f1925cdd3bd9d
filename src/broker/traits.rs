//! Traits for the broker collaborator
//!
//! The dispatch core never talks to a concrete broker. Everything goes
//! through [`BrokerClient`], which keeps the broker swappable and lets tests
//! substitute the in-process implementation.

use crate::broker::error::BrokerResult;
use crate::broker::types::{
    AckHandle, IamPolicy, MessageId, PubsubMessage, ReceivedMessage, SubscriptionHandle,
    SubscriptionInfo, SubscriptionKind, TopicHandle,
};
use async_trait::async_trait;

/// Narrow client interface over a managed message broker
///
/// Administrative calls (topics, subscriptions, IAM) are pass-through only;
/// the publish/pull/acknowledge/modify-deadline calls are what the
/// publisher and consumer are built on.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn create_topic(&self, project: &str, topic: &str) -> BrokerResult<TopicHandle>;

    async fn delete_topic(&self, topic: &TopicHandle) -> BrokerResult<()>;

    /// Subscriptions attached to a topic
    async fn list_topic_subscriptions(
        &self,
        topic: &TopicHandle,
    ) -> BrokerResult<Vec<SubscriptionHandle>>;

    /// Every subscription in a project
    async fn list_subscriptions(&self, project: &str) -> BrokerResult<Vec<SubscriptionInfo>>;

    async fn create_subscription(
        &self,
        project: &str,
        subscription: &str,
        topic: &TopicHandle,
        kind: SubscriptionKind,
        ack_deadline_seconds: u32,
    ) -> BrokerResult<SubscriptionHandle>;

    /// Replace the push endpoint of an existing subscription
    async fn update_push_endpoint(
        &self,
        subscription: &SubscriptionHandle,
        endpoint: &str,
    ) -> BrokerResult<SubscriptionInfo>;

    async fn delete_subscription(&self, subscription: &SubscriptionHandle) -> BrokerResult<()>;

    /// Publish a batch; on success one id is returned per message, in order
    async fn publish(
        &self,
        topic: &TopicHandle,
        messages: Vec<PubsubMessage>,
    ) -> BrokerResult<Vec<MessageId>>;

    /// Pull up to `max_messages` currently available messages without waiting
    async fn pull(
        &self,
        subscription: &SubscriptionHandle,
        max_messages: usize,
    ) -> BrokerResult<Vec<ReceivedMessage>>;

    async fn acknowledge(
        &self,
        subscription: &SubscriptionHandle,
        ack_handles: &[AckHandle],
    ) -> BrokerResult<()>;

    /// Reset the ack deadline of the given deliveries to `seconds` from now.
    /// Zero makes the messages immediately available for redelivery.
    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionHandle,
        ack_handles: &[AckHandle],
        seconds: u32,
    ) -> BrokerResult<()>;

    async fn get_iam_policy(&self, resource: &str) -> BrokerResult<IamPolicy>;

    async fn set_iam_policy(&self, resource: &str, policy: IamPolicy) -> BrokerResult<IamPolicy>;

    /// Returns the subset of `permissions` the caller holds on `resource`
    async fn test_iam_permissions(
        &self,
        resource: &str,
        permissions: &[String],
    ) -> BrokerResult<Vec<String>>;
}
