//! Public API for the broker layer
//!
//! External modules should import from here rather than directly from
//! internal modules.

// Contract
pub use crate::broker::traits::BrokerClient;

// Error handling
pub use crate::broker::error::{BrokerError, BrokerResult, ErrorClass};

// Handles and messages
pub use crate::broker::types::{
    AckHandle, Attributes, IamBinding, IamPolicy, MessageId, PubsubMessage, ReceivedMessage,
    SubscriptionHandle, SubscriptionInfo, SubscriptionKind, TopicHandle,
};

// In-process implementation
pub use crate::broker::memory::{
    BrokerStats, InMemoryBroker, MAX_ACK_DEADLINE_SECONDS, MIN_ACK_DEADLINE_SECONDS,
};
