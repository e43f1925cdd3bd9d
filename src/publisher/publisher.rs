//! Batching publisher
//!
//! Messages go through the [`BatchAccumulator`]; every completed batch is
//! sent by its own task with one broker call per attempt, governed by the
//! [`RetryPolicy`]. Results come back per message through a
//! [`PublishHandle`] so callers can tell which messages need re-submission.

use crate::broker::api::{
    BrokerClient, BrokerError, ErrorClass, MessageId, PubsubMessage, TopicHandle,
};
use crate::core::retry::{retry_async_observed, RetryPolicy};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::sync::handle_mutex_poison;
use crate::core::time::Stopwatch;
use crate::core::validation::ConfigResult;
use crate::notifications::api::{Event, EventBus, PublishEvent, PublishEventType};
use crate::publisher::accumulator::{BatchAccumulator, BatchSettings};
use crate::publisher::error::{PublishError, PublishResult};
use crate::publisher::message::{Batch, OutboundMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Tunables for a [`Publisher`]
#[derive(Debug, Clone, Default)]
pub struct PublisherSettings {
    pub batch: BatchSettings,
    pub retry: RetryPolicy,
    /// Bounds each batch: once exceeded, the broker call in flight is abandoned
    /// and no retry is started. `None` waits for the retry deadline
    pub timeout: Option<Duration>,
}

/// Result for one message of a batch
#[derive(Debug, Clone)]
pub struct MessageOutcome {
    pub message: OutboundMessage,
    pub result: Result<MessageId, PublishError>,
}

/// Outcome of publishing one batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub results: Vec<MessageOutcome>,
    /// Broker calls made for this batch
    pub attempts: u32,
    /// From the first message entering the accumulator to the broker's answer
    pub latency: Duration,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|o| o.result.is_ok())
    }

    pub fn message_ids(&self) -> Vec<&MessageId> {
        self.results
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .collect()
    }

    /// Messages that were not published, with the reason
    pub fn failures(&self) -> Vec<(&OutboundMessage, &PublishError)> {
        self.results
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.message, e)))
            .collect()
    }
}

/// Pending result of [`Publisher::publish`]
#[derive(Debug)]
pub struct PublishHandle {
    receiver: oneshot::Receiver<BatchReport>,
    message_count: usize,
}

impl PublishHandle {
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// Wait for the batch to be published or to fail terminally
    pub async fn wait(self) -> PublishResult<BatchReport> {
        self.receiver.await.map_err(|_| PublishError::Dropped)
    }
}

/// Reports of every batch dispatched for one call
#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    pub reports: Vec<BatchReport>,
    /// Batches whose publish task ended without a report
    pub dropped_batches: usize,
}

impl PublishSummary {
    pub fn published(&self) -> usize {
        self.reports.iter().map(|r| r.message_ids().len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.reports.iter().map(|r| r.failures().len()).sum()
    }

    pub fn message_ids(&self) -> Vec<&MessageId> {
        self.reports.iter().flat_map(|r| r.message_ids()).collect()
    }

    pub fn failures(&self) -> Vec<(&OutboundMessage, &PublishError)> {
        self.reports.iter().flat_map(|r| r.failures()).collect()
    }

    pub fn max_latency(&self) -> Option<Duration> {
        self.reports.iter().map(|r| r.latency).max()
    }
}

struct PublisherInner {
    client: Arc<dyn BrokerClient>,
    topic: TopicHandle,
    accumulator: BatchAccumulator,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    events: EventBus,
    shutdown: ShutdownCoordinator,
    in_flight: Mutex<Vec<PublishHandle>>,
}

/// Batching, retrying publisher for one topic
///
/// Cheap to clone; clones share the accumulator and in-flight tracking.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        topic: TopicHandle,
        settings: PublisherSettings,
        events: EventBus,
        shutdown: ShutdownCoordinator,
    ) -> ConfigResult<Self> {
        let accumulator = BatchAccumulator::new(settings.batch)?;
        Ok(Self {
            inner: Arc::new(PublisherInner {
                client,
                topic,
                accumulator,
                retry: settings.retry,
                timeout: settings.timeout,
                events,
                shutdown,
                in_flight: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn topic(&self) -> &TopicHandle {
        &self.inner.topic
    }

    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.inner.accumulator
    }

    /// Send one batch in the background
    ///
    /// Must be called within a tokio runtime. The returned handle resolves
    /// with a per-message report; it never blocks the caller.
    pub fn publish(&self, batch: Batch) -> PublishHandle {
        let (tx, receiver) = oneshot::channel();
        let message_count = batch.len();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let report = inner.send_batch(batch).await;
            let _ = tx.send(report);
        });
        PublishHandle {
            receiver,
            message_count,
        }
    }

    /// Buffer a message; any batch it completes is dispatched immediately
    pub fn enqueue(&self, message: OutboundMessage) -> PublishResult<()> {
        let mut handles = Vec::new();
        if let Some(batch) = self.inner.accumulator.add(message)? {
            handles.push(self.publish(batch));
        }
        while let Some(batch) = self.inner.accumulator.take_ready()? {
            handles.push(self.publish(batch));
        }
        self.track(handles)
    }

    /// Dispatch everything buffered regardless of thresholds
    pub fn flush(&self) -> PublishResult<usize> {
        let handles: Vec<_> = self
            .inner
            .accumulator
            .flush()?
            .into_iter()
            .map(|batch| self.publish(batch))
            .collect();
        let count = handles.len();
        self.track(handles)?;
        Ok(count)
    }

    /// Dispatch batches whose latency bound has been reached
    pub fn flush_stale(&self) -> PublishResult<usize> {
        let mut handles = Vec::new();
        while let Some(batch) = self.inner.accumulator.flush_if_stale(Instant::now())? {
            handles.push(self.publish(batch));
        }
        let count = handles.len();
        self.track(handles)?;
        Ok(count)
    }

    /// Background task calling [`flush_stale`](Self::flush_stale) until shutdown
    pub fn start_flush_timer(&self) -> JoinHandle<()> {
        let publisher = self.clone();
        let period = (self.inner.accumulator.settings().max_latency / 4)
            .max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = publisher.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = publisher.flush_stale() {
                            log::error!("Flush timer for {} failed: {}", publisher.inner.topic, e);
                        }
                    }
                }
            }
            log::debug!("Flush timer for {} stopped", publisher.inner.topic);
        })
    }

    /// Wait for every dispatched batch, including ones dispatched while waiting
    pub async fn wait_in_flight(&self) -> PublishResult<PublishSummary> {
        let mut summary = PublishSummary::default();
        loop {
            let handles = std::mem::take(&mut *self.lock_in_flight()?);
            if handles.is_empty() {
                return Ok(summary);
            }
            for result in futures::future::join_all(handles.into_iter().map(PublishHandle::wait)).await
            {
                match result {
                    Ok(report) => summary.reports.push(report),
                    Err(e) => {
                        log::error!("Lost publish result for {}: {}", self.inner.topic, e);
                        summary.dropped_batches += 1;
                    }
                }
            }
        }
    }

    /// Publish a list of messages once and wait for every batch
    pub async fn publish_messages(
        &self,
        messages: Vec<OutboundMessage>,
    ) -> PublishResult<PublishSummary> {
        for message in messages {
            self.enqueue(message)?;
        }
        self.flush()?;
        self.wait_in_flight().await
    }

    /// Publish the full list `replication_count` times, one replication after another
    ///
    /// No new replication starts after shutdown has been requested.
    pub async fn publish_all(
        &self,
        messages: &[OutboundMessage],
        replication_count: usize,
    ) -> PublishResult<Vec<PublishSummary>> {
        let mut summaries = Vec::with_capacity(replication_count);
        for replication in 1..=replication_count {
            if self.inner.shutdown.is_shutdown_requested() {
                log::info!(
                    "Shutdown requested; skipping replications {}..={} for {}",
                    replication,
                    replication_count,
                    self.inner.topic
                );
                break;
            }
            log::debug!(
                "Replication {}/{}: publishing {} message(s) to {}",
                replication,
                replication_count,
                messages.len(),
                self.inner.topic
            );
            summaries.push(self.publish_messages(messages.to_vec()).await?);
        }
        Ok(summaries)
    }

    fn track(&self, handles: Vec<PublishHandle>) -> PublishResult<()> {
        if !handles.is_empty() {
            self.lock_in_flight()?.extend(handles);
        }
        Ok(())
    }

    fn lock_in_flight(&self) -> PublishResult<std::sync::MutexGuard<'_, Vec<PublishHandle>>> {
        handle_mutex_poison(self.inner.in_flight.lock(), |msg| PublishError::Internal {
            message: msg,
        })
    }
}

impl PublisherInner {
    async fn send_batch(&self, batch: Batch) -> BatchReport {
        let since_accumulation = Stopwatch::since(batch.started_at());
        let count = batch.len();
        log::debug!(
            "Dispatching batch of {} message(s) to {} after {:.3}s",
            count,
            self.topic,
            since_accumulation.elapsed_secs()
        );
        self.emit(PublishEvent::new(
            PublishEventType::BatchFlushed,
            self.topic.path(),
            count,
        ));

        // Shutdown only stops further attempts; the timeout also interrupts
        // the attempt in flight.
        let scope = self.shutdown.child();
        let expiry = ShutdownCoordinator::new();
        scope.follow(&expiry);
        let timer = self.timeout.map(|timeout| expiry.trigger_after(timeout));
        let wire: Vec<PubsubMessage> = batch.messages().iter().map(OutboundMessage::to_pubsub).collect();
        let client = &self.client;
        let topic = &self.topic;
        let (scope_ref, expiry_ref) = (&scope, &expiry);

        let result = retry_async_observed(
            "publish",
            &self.retry,
            &scope,
            |_attempt| {
                let wire = wire.clone();
                async move {
                    tokio::select! {
                        result = client.publish(topic, wire) => result,
                        _ = expiry_ref.cancelled() => {
                            scope_ref.trigger_shutdown();
                            Err(BrokerError::new(
                                ErrorClass::DeadlineExceeded,
                                "publish timeout reached while the broker call was pending",
                            ))
                        }
                    }
                }
            },
            |notice| {
                self.emit(
                    PublishEvent::new(PublishEventType::RetryScheduled, topic.path(), count)
                        .with_message(format!(
                            "{} on attempt {}, retrying in {:.3}s",
                            notice.error.class,
                            notice.retry + 1,
                            notice.delay.as_secs_f64()
                        )),
                )
            },
        )
        .await;

        if let Some(timer) = timer {
            timer.abort();
        }
        // Ends the scope's watchers on the parent coordinator and the expiry
        scope.trigger_shutdown();

        let latency = since_accumulation.elapsed();
        let messages = batch.into_messages();
        match result {
            Ok(outcome) if outcome.value.len() == count => {
                let ids: Vec<String> = outcome.value.iter().map(|id| id.to_string()).collect();
                log::debug!(
                    "Finished sending {} event(s) to {} | Published message ids: {} | {:.3}s",
                    count,
                    self.topic,
                    ids.join(", "),
                    latency.as_secs_f64()
                );
                self.emit(
                    PublishEvent::new(PublishEventType::Published, self.topic.path(), count)
                        .with_outcome(outcome.attempts, latency),
                );
                BatchReport {
                    results: messages
                        .into_iter()
                        .zip(outcome.value)
                        .map(|(message, id)| MessageOutcome {
                            message,
                            result: Ok(id),
                        })
                        .collect(),
                    attempts: outcome.attempts,
                    latency,
                }
            }
            Ok(outcome) => {
                let error = PublishError::internal(format!(
                    "broker returned {} message id(s) for a batch of {}",
                    outcome.value.len(),
                    count
                ));
                self.fail_batch(messages, error, outcome.attempts, latency)
            }
            Err(error) => {
                let attempts = error.attempts();
                self.fail_batch(messages, error.into(), attempts, latency)
            }
        }
    }

    fn fail_batch(
        &self,
        messages: Vec<OutboundMessage>,
        error: PublishError,
        attempts: u32,
        latency: Duration,
    ) -> BatchReport {
        log::error!(
            "Failed to publish {} message(s) to {}: {}",
            messages.len(),
            self.topic,
            error
        );
        self.emit(
            PublishEvent::new(PublishEventType::Failed, self.topic.path(), messages.len())
                .with_outcome(attempts, latency)
                .with_message(error.to_string()),
        );
        BatchReport {
            results: messages
                .into_iter()
                .map(|message| MessageOutcome {
                    message,
                    result: Err(error.clone()),
                })
                .collect(),
            attempts,
            latency,
        }
    }

    fn emit(&self, event: PublishEvent) {
        self.events.publish(Event::Publish(event));
    }
}
