//! Outbound message and batch types

use crate::broker::api::{Attributes, PubsubMessage};
use std::time::Duration;
use tokio::time::Instant;

/// Payload plus attributes waiting to be published
///
/// Immutable once created. The accumulator takes ownership on
/// [`add`](crate::publisher::api::BatchAccumulator::add).
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    payload: Vec<u8>,
    attributes: Attributes,
    created_at: Instant,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_attributes(payload, Attributes::new())
    }

    pub fn with_attributes(payload: impl Into<Vec<u8>>, attributes: Attributes) -> Self {
        Self {
            payload: payload.into(),
            attributes,
            created_at: Instant::now(),
        }
    }

    /// Message whose payload is the compact JSON encoding of `value`
    pub fn from_json(
        value: &serde_json::Value,
        attributes: Attributes,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::with_attributes(serde_json::to_vec(value)?, attributes))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Bytes counted against a batch's `max_bytes`: payload plus attribute keys and values
    pub fn size(&self) -> usize {
        self.payload.len()
            + self
                .attributes
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    pub(crate) fn to_pubsub(&self) -> PubsubMessage {
        PubsubMessage {
            data: self.payload.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Ordered group of messages flushed together
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    messages: Vec<OutboundMessage>,
    bytes: usize,
    started_at: Instant,
}

impl Batch {
    pub(crate) fn start(first: OutboundMessage, now: Instant) -> Self {
        Self {
            bytes: first.size(),
            messages: vec![first],
            started_at: now,
        }
    }

    pub(crate) fn push(&mut self, message: OutboundMessage) {
        self.bytes += message.size();
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Accumulated size in bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// When the first member was buffered
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn messages(&self) -> &[OutboundMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<OutboundMessage> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_counts_payload_and_attributes() {
        let mut attributes = Attributes::new();
        attributes.insert("origin".to_string(), "python-sample".to_string());
        let message = OutboundMessage::with_attributes(b"hello".to_vec(), attributes);
        assert_eq!(message.size(), 5 + 6 + 13);
        assert_eq!(OutboundMessage::new("abc").size(), 3);
    }

    #[test]
    fn test_from_json_uses_compact_encoding() {
        let value = serde_json::json!({"name": "event", "count": 2});
        let message = OutboundMessage::from_json(&value, Attributes::new()).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(message.payload()).unwrap();
        assert_eq!(decoded, value);
        assert!(!message.payload().contains(&b' '));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_tracks_bytes_and_age() {
        let started = Instant::now();
        let mut batch = Batch::start(OutboundMessage::new("1234"), started);
        batch.push(OutboundMessage::new("56"));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), 6);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(batch.age(Instant::now()), Duration::from_secs(3));
        assert_eq!(batch.age(started - Duration::from_secs(1)), Duration::ZERO);
    }
}
