//! EventBus implementation
//!
//! Each subscriber gets its own unbounded channel and a filter. Publishing
//! never blocks; channels whose receiver was dropped are pruned on the next
//! publish.

use crate::core::sync::handle_mutex_poison;
use crate::notifications::error::NotificationError;
use crate::notifications::event::{Event, EventFilter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

// Queue size at which a slow subscriber is reported
const HIGH_WATER_MARK: usize = 10_000;

/// Delivery counters for one subscriber
#[derive(Debug, Default)]
pub struct SubscriberStatistics {
    queue_size: AtomicUsize,
    delivered: AtomicUsize,
}

impl SubscriberStatistics {
    /// Events sent but not yet received
    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Events received by the subscriber
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    fn record_sent(&self) -> usize {
        self.queue_size.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_received(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.queue_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            })
            .ok();
    }
}

struct SubscriberInfo {
    filter: EventFilter,
    source: String,
    sender: UnboundedSender<Event>,
    statistics: Arc<SubscriberStatistics>,
}

/// Receiving side of a subscription
pub struct EventReceiver {
    receiver: UnboundedReceiver<Event>,
    statistics: Arc<SubscriberStatistics>,
}

impl EventReceiver {
    /// Wait for the next event; `None` once the bus has been dropped
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.receiver.recv().await;
        if event.is_some() {
            self.statistics.record_received();
        }
        event
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Event> {
        let event = self.receiver.try_recv().ok();
        if event.is_some() {
            self.statistics.record_received();
        }
        event
    }

    /// Every event queued right now
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn statistics(&self) -> &SubscriberStatistics {
        &self.statistics
    }
}

/// Fan-out of observability events to filtered subscribers
///
/// Cloning is cheap and every clone shares the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<String, SubscriberInfo>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, replacing any existing one with the same id
    pub fn subscribe(
        &self,
        subscriber_id: &str,
        filter: EventFilter,
        source: &str,
    ) -> Result<EventReceiver, NotificationError> {
        let (sender, receiver) = unbounded_channel();
        let statistics = Arc::new(SubscriberStatistics::default());

        let info = SubscriberInfo {
            filter,
            source: source.to_string(),
            sender,
            statistics: statistics.clone(),
        };

        let mut subscribers = self.lock()?;
        if let Some(existing) = subscribers.insert(subscriber_id.to_string(), info) {
            log::warn!(
                "Subscriber '{}' replaced existing subscription (source: {} -> {})",
                subscriber_id,
                existing.source,
                source
            );
        }

        Ok(EventReceiver {
            receiver,
            statistics,
        })
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> Result<bool, NotificationError> {
        Ok(self.lock()?.remove(subscriber_id).is_some())
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn has_subscriber(&self, subscriber_id: &str) -> bool {
        self.lock()
            .map(|s| s.contains_key(subscriber_id))
            .unwrap_or(false)
    }

    /// Deliver an event, reporting subscribers whose receiver has gone away
    pub fn try_publish(&self, event: Event) -> Result<(), NotificationError> {
        let mut subscribers = self.lock()?;
        let mut failed_subscribers = Vec::new();

        for (subscriber_id, info) in subscribers.iter() {
            if !info.filter.accepts(&event) {
                continue;
            }
            if info.sender.send(event.clone()).is_err() {
                failed_subscribers.push(subscriber_id.clone());
                continue;
            }
            if info.statistics.record_sent() == HIGH_WATER_MARK {
                log::warn!(
                    "Subscriber '{}' ({}) has {} undelivered events",
                    subscriber_id,
                    info.source,
                    HIGH_WATER_MARK
                );
            }
        }

        for subscriber_id in &failed_subscribers {
            subscribers.remove(subscriber_id);
        }

        if !failed_subscribers.is_empty() {
            return Err(NotificationError::PublishFailed {
                event_type: event.kind().to_string(),
                failed_subscribers,
            });
        }
        Ok(())
    }

    /// Deliver an event; delivery problems are logged, never returned
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.try_publish(event) {
            log::trace!("Event delivery incomplete: {}", e);
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, SubscriberInfo>>, NotificationError>
    {
        handle_mutex_poison(self.subscribers.lock(), NotificationError::Internal)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::event::{
        ConsumerEvent, ConsumerEventType, LeaseEvent, LeaseEventType, PublishEvent,
        PublishEventType,
    };

    fn lease_event() -> Event {
        Event::Lease(LeaseEvent::new(
            LeaseEventType::Acknowledged,
            "projects/p/subscriptions/s".to_string(),
            "ack-1".to_string(),
        ))
    }

    fn publish_event() -> Event {
        Event::Publish(PublishEvent::new(
            PublishEventType::BatchFlushed,
            "projects/p/topics/t".to_string(),
            1,
        ))
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        assert!(bus.try_publish(lease_event()).is_ok());
        bus.publish(publish_event());
    }

    #[tokio::test]
    async fn test_filtered_delivery() {
        let bus = EventBus::new();
        let mut leases = bus
            .subscribe("leases", EventFilter::LeaseOnly, "test:leases")
            .unwrap();
        let mut all = bus.subscribe("all", EventFilter::All, "test:all").unwrap();

        bus.publish(publish_event());
        bus.publish(lease_event());
        bus.publish(Event::Consumer(ConsumerEvent::new(
            ConsumerEventType::Started,
            "s".to_string(),
        )));

        let received = leases.drain();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], Event::Lease(_)));

        assert!(matches!(all.recv().await, Some(Event::Publish(_))));
        assert_eq!(all.drain().len(), 2);
        assert_eq!(all.statistics().delivered(), 3);
        assert_eq!(all.statistics().queue_size(), 0);
    }

    #[test]
    fn test_closed_receivers_are_pruned() {
        let bus = EventBus::new();
        let receiver = bus.subscribe("gone", EventFilter::All, "test").unwrap();
        let _kept = bus.subscribe("kept", EventFilter::All, "test").unwrap();
        drop(receiver);

        let err = bus.try_publish(lease_event()).unwrap_err();
        assert_eq!(
            err,
            NotificationError::PublishFailed {
                event_type: "Lease".to_string(),
                failed_subscribers: vec!["gone".to_string()],
            }
        );
        assert!(!bus.has_subscriber("gone"));
        assert!(bus.has_subscriber("kept"));
        assert!(bus.try_publish(lease_event()).is_ok());
    }

    #[test]
    fn test_resubscribe_replaces_and_unsubscribe_removes() {
        let bus = EventBus::new();
        let _first = bus.subscribe("id", EventFilter::All, "one").unwrap();
        let _second = bus.subscribe("id", EventFilter::LeaseOnly, "two").unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe("id").unwrap());
        assert!(!bus.unsubscribe("id").unwrap());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
