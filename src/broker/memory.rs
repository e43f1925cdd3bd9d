//! In-process broker
//!
//! Process-local and ephemeral implementation of [`BrokerClient`]. Every
//! subscription keeps its own backlog; pulled messages stay outstanding until
//! acknowledged, and a delivery whose ack deadline passes is handed out again
//! on the next pull (at-least-once). Fault injection and per-handle call
//! counters make it the test double for the publisher and consumer.

use crate::broker::error::{BrokerError, BrokerResult, ErrorClass};
use crate::broker::traits::BrokerClient;
use crate::broker::types::{
    AckHandle, IamPolicy, MessageId, PubsubMessage, ReceivedMessage, SubscriptionHandle,
    SubscriptionInfo, SubscriptionKind, TopicHandle,
};
use crate::core::sync::handle_mutex_poison;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Broker-imposed bounds on a subscription ack deadline
pub const MIN_ACK_DEADLINE_SECONDS: u32 = 10;
pub const MAX_ACK_DEADLINE_SECONDS: u32 = 600;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    data: Vec<u8>,
    attributes: crate::broker::types::Attributes,
    publish_time: SystemTime,
    delivery_attempt: u32,
}

#[derive(Debug)]
struct Delivery {
    message: StoredMessage,
    expires_at: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    info: SubscriptionInfo,
    backlog: VecDeque<StoredMessage>,
    outstanding: HashMap<AckHandle, Delivery>,
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: Vec<String>,
}

/// Call counters exposed for inspection
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub publish_calls: u64,
    pub published_messages: u64,
    pub pull_calls: u64,
    pub redeliveries: u64,
    pub nacks: u64,
    /// Calls that were left hanging by [`InMemoryBroker::stall_publish`] or
    /// [`InMemoryBroker::stall_acknowledge`]
    pub stalled_calls: u64,
    /// Acknowledge requests received per ack handle (including repeats)
    pub acknowledgments: HashMap<AckHandle, u32>,
    /// Non-zero deadline modifications received per ack handle
    pub deadline_extensions: HashMap<AckHandle, u32>,
}

impl BrokerStats {
    pub fn ack_count(&self, handle: &AckHandle) -> u32 {
        self.acknowledgments.get(handle).copied().unwrap_or(0)
    }

    pub fn extension_count(&self, handle: &AckHandle) -> u32 {
        self.deadline_extensions.get(handle).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    subscriptions: HashMap<String, SubscriptionState>,
    policies: HashMap<String, IamPolicy>,
    publish_faults: VecDeque<ErrorClass>,
    pull_faults: VecDeque<ErrorClass>,
    stall_publish: bool,
    stall_acknowledge: bool,
    next_message_id: u64,
    next_ack_id: u64,
    stats: BrokerStats,
}

impl BrokerState {
    fn subscription_mut(&mut self, handle: &SubscriptionHandle) -> BrokerResult<&mut SubscriptionState> {
        let path = handle.path();
        self.subscriptions
            .get_mut(&path)
            .ok_or_else(|| BrokerError::not_found(&path))
    }

    fn resource_exists(&self, resource: &str) -> bool {
        self.topics.contains_key(resource) || self.subscriptions.contains_key(resource)
    }
}

/// Process-local broker implementing the full [`BrokerClient`] contract
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, BrokerState>> {
        handle_mutex_poison(self.state.lock(), |message| {
            BrokerError::new(ErrorClass::InternalServerError, message)
        })
    }

    /// Make the next `count` publish calls fail with `class`
    pub fn inject_publish_failures(&self, class: ErrorClass, count: usize) -> BrokerResult<()> {
        let mut state = self.lock()?;
        state.publish_faults.extend(std::iter::repeat(class).take(count));
        Ok(())
    }

    /// Make the next `count` pull calls fail with `class`
    pub fn inject_pull_failures(&self, class: ErrorClass, count: usize) -> BrokerResult<()> {
        let mut state = self.lock()?;
        state.pull_faults.extend(std::iter::repeat(class).take(count));
        Ok(())
    }

    /// Make every following publish call hang without answering
    pub fn stall_publish(&self, stalled: bool) -> BrokerResult<()> {
        self.lock()?.stall_publish = stalled;
        Ok(())
    }

    /// Make every following acknowledge call hang without answering
    pub fn stall_acknowledge(&self, stalled: bool) -> BrokerResult<()> {
        self.lock()?.stall_acknowledge = stalled;
        Ok(())
    }

    /// Count the call as stalled if `stall` says so
    fn is_stalled(&self, stall: impl Fn(&BrokerState) -> bool) -> BrokerResult<bool> {
        let mut state = self.lock()?;
        let stalled = stall(&state);
        if stalled {
            state.stats.stalled_calls += 1;
        }
        Ok(stalled)
    }

    /// Snapshot of the call counters
    pub fn stats(&self) -> BrokerResult<BrokerStats> {
        Ok(self.lock()?.stats.clone())
    }

    /// Messages waiting to be pulled from a subscription
    pub fn backlog_len(&self, subscription: &SubscriptionHandle) -> BrokerResult<usize> {
        let mut state = self.lock()?;
        Ok(state.subscription_mut(subscription)?.backlog.len())
    }

    /// Deliveries handed out and not yet acknowledged
    pub fn outstanding_len(&self, subscription: &SubscriptionHandle) -> BrokerResult<usize> {
        let mut state = self.lock()?;
        Ok(state.subscription_mut(subscription)?.outstanding.len())
    }
}

fn validate_ack_deadline(seconds: u32) -> BrokerResult<()> {
    if !(MIN_ACK_DEADLINE_SECONDS..=MAX_ACK_DEADLINE_SECONDS).contains(&seconds) {
        return Err(BrokerError::new(
            ErrorClass::InvalidArgument,
            format!(
                "ack deadline must be between {MIN_ACK_DEADLINE_SECONDS} and {MAX_ACK_DEADLINE_SECONDS} seconds, got {seconds}"
            ),
        ));
    }
    Ok(())
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn create_topic(&self, project: &str, topic: &str) -> BrokerResult<TopicHandle> {
        let handle = TopicHandle::new(project, topic);
        let path = handle.path();
        let mut state = self.lock()?;
        if state.topics.contains_key(&path) {
            return Err(BrokerError::already_exists(&path));
        }
        state.topics.insert(path, TopicState::default());
        log::trace!("in-memory broker: created topic {handle}");
        Ok(handle)
    }

    async fn delete_topic(&self, topic: &TopicHandle) -> BrokerResult<()> {
        let path = topic.path();
        let mut state = self.lock()?;
        // Attached subscriptions survive but stop receiving messages
        state
            .topics
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| BrokerError::not_found(&path))?;
        state.policies.remove(&path);
        Ok(())
    }

    async fn list_topic_subscriptions(
        &self,
        topic: &TopicHandle,
    ) -> BrokerResult<Vec<SubscriptionHandle>> {
        let path = topic.path();
        let state = self.lock()?;
        let topic_state = state
            .topics
            .get(&path)
            .ok_or_else(|| BrokerError::not_found(&path))?;
        Ok(topic_state
            .subscriptions
            .iter()
            .filter_map(|sub| state.subscriptions.get(sub))
            .map(|sub| sub.info.handle.clone())
            .collect())
    }

    async fn list_subscriptions(&self, project: &str) -> BrokerResult<Vec<SubscriptionInfo>> {
        let state = self.lock()?;
        let mut infos: Vec<SubscriptionInfo> = state
            .subscriptions
            .values()
            .filter(|sub| sub.info.handle.project == project)
            .map(|sub| sub.info.clone())
            .collect();
        infos.sort_by(|a, b| a.handle.subscription.cmp(&b.handle.subscription));
        Ok(infos)
    }

    async fn create_subscription(
        &self,
        project: &str,
        subscription: &str,
        topic: &TopicHandle,
        kind: SubscriptionKind,
        ack_deadline_seconds: u32,
    ) -> BrokerResult<SubscriptionHandle> {
        validate_ack_deadline(ack_deadline_seconds)?;
        let handle = SubscriptionHandle::new(project, subscription);
        let path = handle.path();
        let topic_path = topic.path();

        let mut state = self.lock()?;
        if state.subscriptions.contains_key(&path) {
            return Err(BrokerError::already_exists(&path));
        }
        state
            .topics
            .get_mut(&topic_path)
            .ok_or_else(|| BrokerError::not_found(&topic_path))?
            .subscriptions
            .push(path.clone());
        state.subscriptions.insert(
            path,
            SubscriptionState {
                info: SubscriptionInfo {
                    handle: handle.clone(),
                    topic: topic.clone(),
                    kind,
                    ack_deadline_seconds,
                },
                backlog: VecDeque::new(),
                outstanding: HashMap::new(),
            },
        );
        log::trace!("in-memory broker: created subscription {handle} on {topic}");
        Ok(handle)
    }

    async fn update_push_endpoint(
        &self,
        subscription: &SubscriptionHandle,
        endpoint: &str,
    ) -> BrokerResult<SubscriptionInfo> {
        let mut state = self.lock()?;
        let sub = state.subscription_mut(subscription)?;
        sub.info.kind = SubscriptionKind::Push {
            endpoint: endpoint.to_string(),
        };
        Ok(sub.info.clone())
    }

    async fn delete_subscription(&self, subscription: &SubscriptionHandle) -> BrokerResult<()> {
        let path = subscription.path();
        let mut state = self.lock()?;
        let removed = state
            .subscriptions
            .remove(&path)
            .ok_or_else(|| BrokerError::not_found(&path))?;
        if let Some(topic) = state.topics.get_mut(&removed.info.topic.path()) {
            topic.subscriptions.retain(|s| s != &path);
        }
        state.policies.remove(&path);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &TopicHandle,
        messages: Vec<PubsubMessage>,
    ) -> BrokerResult<Vec<MessageId>> {
        if self.is_stalled(|state| state.stall_publish)? {
            return std::future::pending().await;
        }
        let path = topic.path();
        let mut state = self.lock()?;
        state.stats.publish_calls += 1;

        if let Some(class) = state.publish_faults.pop_front() {
            return Err(BrokerError::new(class, "injected publish failure"));
        }
        if messages.is_empty() {
            return Err(BrokerError::new(
                ErrorClass::InvalidArgument,
                "publish request contains no messages",
            ));
        }
        let subscriptions = state
            .topics
            .get(&path)
            .ok_or_else(|| BrokerError::not_found(&path))?
            .subscriptions
            .clone();

        let publish_time = SystemTime::now();
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            state.next_message_id += 1;
            let stored = StoredMessage {
                id: MessageId(state.next_message_id.to_string()),
                data: message.data,
                attributes: message.attributes,
                publish_time,
                delivery_attempt: 0,
            };
            for sub in &subscriptions {
                if let Some(sub_state) = state.subscriptions.get_mut(sub) {
                    sub_state.backlog.push_back(stored.clone());
                }
            }
            ids.push(stored.id);
        }
        state.stats.published_messages += ids.len() as u64;
        Ok(ids)
    }

    async fn pull(
        &self,
        subscription: &SubscriptionHandle,
        max_messages: usize,
    ) -> BrokerResult<Vec<ReceivedMessage>> {
        if max_messages == 0 {
            return Err(BrokerError::new(
                ErrorClass::InvalidArgument,
                "max_messages must be positive",
            ));
        }
        let now = Instant::now();
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.stats.pull_calls += 1;

        if let Some(class) = state.pull_faults.pop_front() {
            return Err(BrokerError::new(class, "injected pull failure"));
        }

        let path = subscription.path();
        let sub = state
            .subscriptions
            .get_mut(&path)
            .ok_or_else(|| BrokerError::not_found(&path))?;

        // Expired leases go back to the backlog before anything new is handed out
        let expired: Vec<AckHandle> = sub
            .outstanding
            .iter()
            .filter(|(_, delivery)| delivery.expires_at <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some(delivery) = sub.outstanding.remove(&handle) {
                sub.backlog.push_back(delivery.message);
                state.stats.redeliveries += 1;
            }
        }

        let deadline = Duration::from_secs(u64::from(sub.info.ack_deadline_seconds));
        let mut received = Vec::new();
        while received.len() < max_messages {
            let Some(mut message) = sub.backlog.pop_front() else {
                break;
            };
            message.delivery_attempt += 1;
            state.next_ack_id += 1;
            let ack_handle = AckHandle(format!("ack-{}", state.next_ack_id));
            received.push(ReceivedMessage {
                ack_handle: ack_handle.clone(),
                message_id: message.id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
                publish_time: message.publish_time,
                delivery_attempt: message.delivery_attempt,
            });
            sub.outstanding.insert(
                ack_handle,
                Delivery {
                    message,
                    expires_at: now + deadline,
                },
            );
        }
        Ok(received)
    }

    async fn acknowledge(
        &self,
        subscription: &SubscriptionHandle,
        ack_handles: &[AckHandle],
    ) -> BrokerResult<()> {
        if self.is_stalled(|state| state.stall_acknowledge)? {
            return std::future::pending().await;
        }
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let path = subscription.path();
        let sub = state
            .subscriptions
            .get_mut(&path)
            .ok_or_else(|| BrokerError::not_found(&path))?;
        for handle in ack_handles {
            // Unknown or expired handles are ignored, as a real broker does
            sub.outstanding.remove(handle);
            *state.stats.acknowledgments.entry(handle.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionHandle,
        ack_handles: &[AckHandle],
        seconds: u32,
    ) -> BrokerResult<()> {
        if seconds > MAX_ACK_DEADLINE_SECONDS {
            return Err(BrokerError::new(
                ErrorClass::InvalidArgument,
                format!("ack deadline extension of {seconds}s exceeds {MAX_ACK_DEADLINE_SECONDS}s"),
            ));
        }
        let now = Instant::now();
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let path = subscription.path();
        let sub = state
            .subscriptions
            .get_mut(&path)
            .ok_or_else(|| BrokerError::not_found(&path))?;
        for handle in ack_handles {
            if let Some(delivery) = sub.outstanding.get_mut(handle) {
                delivery.expires_at = now + Duration::from_secs(u64::from(seconds));
            }
            if seconds == 0 {
                state.stats.nacks += 1;
            } else {
                *state
                    .stats
                    .deadline_extensions
                    .entry(handle.clone())
                    .or_insert(0) += 1;
            }
        }
        Ok(())
    }

    async fn get_iam_policy(&self, resource: &str) -> BrokerResult<IamPolicy> {
        let state = self.lock()?;
        if !state.resource_exists(resource) {
            return Err(BrokerError::not_found(resource));
        }
        Ok(state.policies.get(resource).cloned().unwrap_or_default())
    }

    async fn set_iam_policy(&self, resource: &str, mut policy: IamPolicy) -> BrokerResult<IamPolicy> {
        let mut state = self.lock()?;
        if !state.resource_exists(resource) {
            return Err(BrokerError::not_found(resource));
        }
        let current_etag = state.policies.get(resource).map(|p| p.etag).unwrap_or(0);
        if policy.etag != current_etag {
            return Err(BrokerError::new(
                ErrorClass::Aborted,
                format!("policy for {resource} changed concurrently"),
            ));
        }
        policy.etag = current_etag + 1;
        state.policies.insert(resource.to_string(), policy.clone());
        Ok(policy)
    }

    async fn test_iam_permissions(
        &self,
        resource: &str,
        permissions: &[String],
    ) -> BrokerResult<Vec<String>> {
        let state = self.lock()?;
        if !state.resource_exists(resource) {
            return Err(BrokerError::not_found(resource));
        }
        // No authentication in-process: the caller holds every permission
        Ok(permissions.to_vec())
    }
}
