//! Type definitions for the broker contract
//!
//! Handles, identifiers and wire messages exchanged with a
//! [`BrokerClient`](crate::broker::api::BrokerClient).

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// String attributes attached to a message
pub type Attributes = BTreeMap<String, String>;

/// Fully qualified topic reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicHandle {
    pub project: String,
    pub topic: String,
}

impl TopicHandle {
    pub fn new(project: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            topic: topic.into(),
        }
    }

    /// Resource path in the form `projects/{project}/topics/{topic}`
    pub fn path(&self) -> String {
        format!("projects/{}/topics/{}", self.project, self.topic)
    }
}

impl fmt::Display for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Delivery mode of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    Pull,
    Push { endpoint: String },
}

/// Fully qualified subscription reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub project: String,
    pub subscription: String,
}

impl SubscriptionHandle {
    pub fn new(project: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            subscription: subscription.into(),
        }
    }

    /// Resource path in the form `projects/{project}/subscriptions/{subscription}`
    pub fn path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project, self.subscription
        )
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Subscription description returned by administrative calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub handle: SubscriptionHandle,
    pub topic: TopicHandle,
    pub kind: SubscriptionKind,
    pub ack_deadline_seconds: u32,
}

/// Broker-assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token identifying one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckHandle(pub String);

impl fmt::Display for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message as sent to the broker's publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubsubMessage {
    pub data: Vec<u8>,
    pub attributes: Attributes,
}

/// Message as returned by the broker's pull call
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub ack_handle: AckHandle,
    pub message_id: MessageId,
    pub data: Vec<u8>,
    pub attributes: Attributes,
    pub publish_time: SystemTime,
    /// 1 for the first delivery, incremented on every redelivery
    pub delivery_attempt: u32,
}

/// One role binding of an IAM policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamBinding {
    pub role: String,
    pub members: Vec<String>,
}

/// IAM policy attached to a topic or subscription
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IamPolicy {
    pub bindings: Vec<IamBinding>,
    pub etag: u64,
}

impl IamPolicy {
    /// Add a binding, merging members into an existing binding for the same role
    pub fn add_binding(&mut self, role: &str, members: &[&str]) {
        match self.bindings.iter_mut().find(|b| b.role == role) {
            Some(binding) => {
                for member in members {
                    if !binding.members.iter().any(|m| m == member) {
                        binding.members.push((*member).to_string());
                    }
                }
            }
            None => self.bindings.push(IamBinding {
                role: role.to_string(),
                members: members.iter().map(|m| m.to_string()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_paths() {
        let topic = TopicHandle::new("proj", "events");
        assert_eq!(topic.path(), "projects/proj/topics/events");
        let sub = SubscriptionHandle::new("proj", "events-sub");
        assert_eq!(sub.to_string(), "projects/proj/subscriptions/events-sub");
    }

    #[test]
    fn test_add_binding_merges_members() {
        let mut policy = IamPolicy::default();
        policy.add_binding("roles/pubsub.viewer", &["allUsers"]);
        policy.add_binding("roles/pubsub.viewer", &["allUsers", "user:a@example.com"]);
        policy.add_binding("roles/editor", &["group:cloud-logs@google.com"]);

        assert_eq!(policy.bindings.len(), 2);
        assert_eq!(
            policy.bindings[0].members,
            vec!["allUsers".to_string(), "user:a@example.com".to_string()]
        );
    }
}
