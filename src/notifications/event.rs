//! Event types for the notification system

use std::time::{Duration, SystemTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishEventType {
    /// A batch left the accumulator and was handed to a publish task
    BatchFlushed,
    /// The broker accepted the batch
    Published,
    RetryScheduled,
    /// The batch failed terminally; every message in it is reported failed
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseEventType {
    Leased,
    Extended,
    Acknowledged,
    Abandoned,
    /// Held for longer than the maximum lease; no further extensions
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerEventType {
    Started,
    /// Flow budget exhausted; pulling suspended
    Paused,
    Resumed,
    Draining,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct PublishEvent {
    pub event_type: PublishEventType,
    pub timestamp: SystemTime,
    pub topic: String,
    pub message_count: usize,
    pub attempts: Option<u32>,
    pub latency: Option<Duration>,
    pub message: Option<String>,
}

impl PublishEvent {
    pub fn new(event_type: PublishEventType, topic: String, message_count: usize) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            topic,
            message_count,
            attempts: None,
            latency: None,
            message: None,
        }
    }

    pub fn with_outcome(mut self, attempts: u32, latency: Duration) -> Self {
        self.attempts = Some(attempts);
        self.latency = Some(latency);
        self
    }

    pub fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }
}

#[derive(Clone, Debug)]
pub struct LeaseEvent {
    pub event_type: LeaseEventType,
    pub timestamp: SystemTime,
    pub subscription: String,
    pub ack_handle: String,
    pub message: Option<String>,
}

impl LeaseEvent {
    pub fn new(event_type: LeaseEventType, subscription: String, ack_handle: String) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            subscription,
            ack_handle,
            message: None,
        }
    }

    pub fn with_message(
        event_type: LeaseEventType,
        subscription: String,
        ack_handle: String,
        message: String,
    ) -> Self {
        Self {
            message: Some(message),
            ..Self::new(event_type, subscription, ack_handle)
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsumerEvent {
    pub event_type: ConsumerEventType,
    pub timestamp: SystemTime,
    pub subscription: String,
    pub outstanding: Option<usize>,
}

impl ConsumerEvent {
    pub fn new(event_type: ConsumerEventType, subscription: String) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            subscription,
            outstanding: None,
        }
    }

    pub fn with_outstanding(
        event_type: ConsumerEventType,
        subscription: String,
        outstanding: usize,
    ) -> Self {
        Self {
            outstanding: Some(outstanding),
            ..Self::new(event_type, subscription)
        }
    }
}

/// Events carried by the [`EventBus`](crate::notifications::api::EventBus)
#[derive(Clone, Debug)]
pub enum Event {
    Publish(PublishEvent),
    Lease(LeaseEvent),
    Consumer(ConsumerEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Publish(_) => "Publish",
            Event::Lease(_) => "Lease",
            Event::Consumer(_) => "Consumer",
        }
    }
}

/// Event filtering options for subscribers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventFilter {
    PublishOnly,
    LeaseOnly,
    ConsumerOnly,
    LeaseAndConsumer,
    All,
}

impl EventFilter {
    /// Check if an event should be accepted by this filter
    pub fn accepts(&self, event: &Event) -> bool {
        matches!(
            (self, event),
            (EventFilter::PublishOnly, Event::Publish(_))
                | (EventFilter::LeaseOnly, Event::Lease(_))
                | (EventFilter::ConsumerOnly, Event::Consumer(_))
                | (EventFilter::LeaseAndConsumer, Event::Lease(_))
                | (EventFilter::LeaseAndConsumer, Event::Consumer(_))
                | (EventFilter::All, _)
        )
    }
}
