//! Inbound message type

use crate::broker::api::{AckHandle, Attributes, MessageId, ReceivedMessage};
use std::borrow::Cow;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// A delivered message handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub ack_handle: AckHandle,
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub attributes: Attributes,
    pub publish_time: SystemTime,
    pub received_at: Instant,
    /// Ack deadline expiry as of receipt
    pub deadline: Instant,
    pub delivery_attempt: u32,
}

impl InboundMessage {
    pub fn from_received(received: ReceivedMessage, ack_deadline: Duration) -> Self {
        let received_at = Instant::now();
        Self {
            ack_handle: received.ack_handle,
            message_id: received.message_id,
            payload: received.data,
            attributes: received.attributes,
            publish_time: received.publish_time,
            received_at,
            deadline: received_at + ack_deadline,
            delivery_attempt: received.delivery_attempt,
        }
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_attempt > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_from_received_sets_deadline() {
        let received = ReceivedMessage {
            ack_handle: AckHandle("ack-1".to_string()),
            message_id: MessageId("7".to_string()),
            data: b"{\"k\":1}".to_vec(),
            attributes: Attributes::new(),
            publish_time: SystemTime::now(),
            delivery_attempt: 2,
        };
        let message = InboundMessage::from_received(received, Duration::from_secs(30));

        assert_eq!(message.deadline - message.received_at, Duration::from_secs(30));
        assert_eq!(message.payload_str(), "{\"k\":1}");
        assert!(message.is_redelivery());
    }
}
