//! Lease-managed pull consumer

use crate::broker::api::{AckHandle, BrokerClient, BrokerError, SubscriptionHandle};
use crate::core::retry::{retry_async, RetryDecision, RetryPolicy};
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::validation::{
    require_positive, require_positive_seconds, validate_lease_timing, ConfigResult,
};
use crate::notifications::api::{ConsumerEvent, ConsumerEventType, Event, EventBus};
use crate::subscriber::error::{SubscribeError, SubscribeResult, WorkerError};
use crate::subscriber::flow::FlowController;
use crate::subscriber::lease::{LeaseManager, LeaseOutcome};
use crate::subscriber::message::InboundMessage;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;

/// How long aborted workers get to settle before their supervisors are dropped
const ABORT_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Tuning for a [`Consumer`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Upper bound on admitted, not yet settled messages
    pub max_outstanding: usize,
    /// Most messages requested by one pull
    pub pull_batch_size: usize,
    pub ack_deadline_seconds: u32,
    /// Period of the lease extension loop
    pub lease_tick: Duration,
    /// Leases held longer than this are no longer extended
    pub max_lease: Duration,
    /// Wait after a pull that returned nothing
    pub idle_poll: Duration,
    /// Re-check interval while the flow budget is exhausted
    pub backpressure_poll: Duration,
    /// How long a stopping consumer waits for in-flight workers
    pub shutdown_grace: Duration,
    /// Backoff for transient pull failures
    pub pull_retry: RetryPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_outstanding: 10,
            pull_batch_size: 10,
            ack_deadline_seconds: 30,
            lease_tick: Duration::from_secs(10),
            max_lease: Duration::from_secs(3600),
            idle_poll: Duration::from_millis(100),
            backpressure_poll: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(30),
            pull_retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        require_positive("max_outstanding", self.max_outstanding)?;
        require_positive("pull_batch_size", self.pull_batch_size)?;
        validate_lease_timing(
            self.ack_deadline_seconds,
            self.lease_tick.as_secs_f64(),
            self.max_lease.as_secs(),
        )?;
        require_positive_seconds("idle_poll", self.idle_poll.as_secs_f64())?;
        require_positive_seconds("backpressure_poll", self.backpressure_poll.as_secs_f64())
    }

    fn ack_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.ack_deadline_seconds))
    }
}

/// What happened during one [`Consumer::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub received: u64,
    pub acknowledged: u64,
    pub abandoned: u64,
    /// Pulled but returned to the broker without being dispatched
    pub nacked: u64,
    pub extensions: u64,
    pub worker_failures: u64,
    /// Workers still running when the grace period ran out
    pub aborted_workers: u64,
}

impl ConsumerReport {
    fn record(&mut self, settled: Result<Settlement, JoinError>) {
        match settled {
            Ok(settlement) => {
                match settlement.outcome {
                    LeaseOutcome::Acknowledged => self.acknowledged += 1,
                    LeaseOutcome::Abandoned => self.abandoned += 1,
                    LeaseOutcome::NotLeased => {}
                }
                if settlement.worker_failed {
                    self.worker_failures += 1;
                }
            }
            // Gave up waiting for the broker to settle the message
            Err(e) if e.is_cancelled() => self.abandoned += 1,
            Err(e) => log::error!("Message supervisor terminated abnormally: {}", e),
        }
    }
}

struct Settlement {
    outcome: LeaseOutcome,
    worker_failed: bool,
}

/// Pulls messages and runs one worker task per admitted message
///
/// Intake is gated by a [`FlowController`]; every dispatched message is
/// leased through a [`LeaseManager`] whose extension loop runs for the
/// duration of [`run`](Self::run).
pub struct Consumer {
    client: Arc<dyn BrokerClient>,
    subscription: SubscriptionHandle,
    settings: ConsumerSettings,
    events: EventBus,
    flow: Arc<FlowController>,
    lease: Arc<LeaseManager>,
}

impl Consumer {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        subscription: SubscriptionHandle,
        settings: ConsumerSettings,
        events: EventBus,
    ) -> ConfigResult<Self> {
        settings.validate()?;
        let flow = Arc::new(FlowController::new(settings.max_outstanding)?);
        let lease = Arc::new(LeaseManager::new(
            Arc::clone(&client),
            subscription.clone(),
            settings.ack_deadline_seconds,
            settings.max_lease,
            Arc::clone(&flow),
            events.clone(),
        ));
        Ok(Self {
            client,
            subscription,
            settings,
            events,
            flow,
            lease,
        })
    }

    pub fn subscription(&self) -> &SubscriptionHandle {
        &self.subscription
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn flow(&self) -> &Arc<FlowController> {
        &self.flow
    }

    pub fn lease(&self) -> &Arc<LeaseManager> {
        &self.lease
    }

    /// Pull and dispatch messages until `shutdown` is triggered
    ///
    /// `handler` is invoked once per admitted message on its own task and
    /// receives the shutdown token so it can stop early. `Ok(())`
    /// acknowledges the message; an error abandons it for redelivery.
    ///
    /// On shutdown the consumer stops pulling, waits up to
    /// `shutdown_grace` for running workers, aborts the rest and abandons
    /// whatever is still leased. Settlements still waiting on the broker
    /// after that are dropped and counted as abandoned. A permanent pull failure stops the
    /// consumer the same way and is returned as an error.
    pub async fn run<H, Fut>(
        &self,
        handler: H,
        shutdown: &ShutdownCoordinator,
    ) -> SubscribeResult<ConsumerReport>
    where
        H: Fn(InboundMessage, ShutdownCoordinator) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let mut report = ConsumerReport::default();
        let extensions_before = self.lease.stats().extensions;
        let mut supervisors: JoinSet<Settlement> = JoinSet::new();

        // Extensions must continue while workers drain, so the ticker has
        // its own stop token.
        let ticker_stop = ShutdownCoordinator::new();
        let ticker = tokio::spawn(
            Arc::clone(&self.lease).extend_loop(self.settings.lease_tick, ticker_stop.clone()),
        );

        log::debug!("Listening for messages on {}", self.subscription);
        self.emit(ConsumerEventType::Started);

        let failure = self
            .pull_loop(&handler, shutdown, &mut supervisors, &mut report)
            .await
            .err();

        self.emit_with_outstanding(ConsumerEventType::Draining);
        log::debug!(
            "Stopping consumer on {}: waiting up to {:.1}s for {} in-flight message(s)",
            self.subscription,
            self.settings.shutdown_grace.as_secs_f64(),
            supervisors.len()
        );
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while let Some(settled) = supervisors.join_next().await {
                report.record(settled);
            }
        })
        .await;
        if drained.is_err() {
            let aborted = self.lease.abort_workers().await;
            report.aborted_workers += aborted as u64;
            log::warn!(
                "Grace period of {:.1}s elapsed on {}; aborted {} worker(s)",
                self.settings.shutdown_grace.as_secs_f64(),
                self.subscription,
                aborted
            );
            let settled = tokio::time::timeout(ABORT_SETTLE_TIMEOUT, async {
                while let Some(settled) = supervisors.join_next().await {
                    report.record(settled);
                }
            })
            .await;
            if settled.is_err() {
                log::warn!(
                    "{} message(s) on {} still waiting for the broker; giving up on them",
                    supervisors.len(),
                    self.subscription
                );
                supervisors.abort_all();
                while let Some(settled) = supervisors.join_next().await {
                    report.record(settled);
                }
            }
        }

        ticker_stop.trigger_shutdown();
        if let Err(e) = ticker.await {
            log::error!("Lease extension loop for {} failed: {}", self.subscription, e);
        }
        report.abandoned += self.lease.abandon_all("consumer stopped").await as u64;
        report.extensions = self.lease.stats().extensions - extensions_before;

        log::info!(
            "Consumer on {} stopped: {} received, {} acknowledged, {} abandoned, {} returned, {} worker failure(s)",
            self.subscription,
            report.received,
            report.acknowledged,
            report.abandoned,
            report.nacked,
            report.worker_failures
        );
        self.emit(ConsumerEventType::Stopped);

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// [`run`](Self::run) bounded by an optional timeout
    ///
    /// Reaching the timeout stops the consumer gracefully and is not an
    /// error. Triggering `shutdown` still stops it early.
    pub async fn run_for<H, Fut>(
        &self,
        handler: H,
        shutdown: &ShutdownCoordinator,
        timeout: Option<Duration>,
    ) -> SubscribeResult<ConsumerReport>
    where
        H: Fn(InboundMessage, ShutdownCoordinator) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let scope = shutdown.child();
        let timer = timeout.map(|timeout| scope.trigger_after(timeout));
        let result = self.run(handler, &scope).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        scope.trigger_shutdown();
        result
    }

    /// Pull one batch, acknowledge all of it and return it
    ///
    /// Transient pull failures are retried with `pull_retry`. No lease is
    /// taken; the messages are acknowledged before they are returned.
    pub async fn synchronous_pull(
        &self,
        max_messages: usize,
        shutdown: &ShutdownCoordinator,
    ) -> SubscribeResult<Vec<InboundMessage>> {
        let outcome = retry_async("pull", &self.settings.pull_retry, shutdown, |_attempt| {
            self.client.pull(&self.subscription, max_messages)
        })
        .await
        .map_err(|source| SubscribeError::SyncPull {
            subscription: self.subscription.path(),
            source,
        })?;

        let ack_deadline = self.settings.ack_deadline();
        let messages: Vec<InboundMessage> = outcome
            .value
            .into_iter()
            .map(|received| InboundMessage::from_received(received, ack_deadline))
            .collect();
        if messages.is_empty() {
            log::debug!("No messages available on {}", self.subscription);
            return Ok(messages);
        }

        let handles: Vec<AckHandle> = messages.iter().map(|m| m.ack_handle.clone()).collect();
        self.client
            .acknowledge(&self.subscription, &handles)
            .await
            .map_err(|source| SubscribeError::Acknowledge {
                subscription: self.subscription.path(),
                source,
            })?;

        for message in &messages {
            log::debug!(
                "Received message {}: {} {:?}",
                message.message_id,
                message.payload_str(),
                message.attributes
            );
        }
        log::info!(
            "Received and acknowledged {} message(s) from {}",
            messages.len(),
            self.subscription
        );
        Ok(messages)
    }

    async fn pull_loop<H, Fut>(
        &self,
        handler: &H,
        shutdown: &ShutdownCoordinator,
        supervisors: &mut JoinSet<Settlement>,
        report: &mut ConsumerReport,
    ) -> SubscribeResult<()>
    where
        H: Fn(InboundMessage, ShutdownCoordinator) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let mut paused = false;
        let mut failing_since: Option<Instant> = None;
        let mut consecutive_failures: u32 = 0;

        loop {
            while let Some(Some(settled)) = supervisors.join_next().now_or_never() {
                report.record(settled);
            }
            if shutdown.is_shutdown_requested() {
                return Ok(());
            }

            let available = self.flow.available();
            if available == 0 {
                if !paused {
                    paused = true;
                    log::debug!(
                        "Pausing pulls on {}: {} message(s) outstanding",
                        self.subscription,
                        self.flow.outstanding()
                    );
                    self.emit_with_outstanding(ConsumerEventType::Paused);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = self.flow.wait_for_capacity(self.settings.backpressure_poll) => {}
                }
                continue;
            }
            if paused {
                paused = false;
                log::debug!("Resuming pulls on {}", self.subscription);
                self.emit_with_outstanding(ConsumerEventType::Resumed);
            }

            let max_messages = available.min(self.settings.pull_batch_size);
            let pulled = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                pulled = self.client.pull(&self.subscription, max_messages) => pulled,
            };

            let received = match pulled {
                Ok(received) => {
                    failing_since = None;
                    consecutive_failures = 0;
                    received
                }
                Err(e) => {
                    let started = *failing_since.get_or_insert_with(Instant::now);
                    let delay = self.pull_backoff(&e, started, consecutive_failures)?;
                    consecutive_failures += 1;
                    log::warn!(
                        "Pull from {} failed ({}); retrying in {:.3}s",
                        self.subscription,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            if received.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.settings.idle_poll) => {}
                }
                continue;
            }

            let mut returned = Vec::new();
            for received in received {
                report.received += 1;
                let message =
                    InboundMessage::from_received(received, self.settings.ack_deadline());
                if shutdown.is_shutdown_requested() || !self.flow.try_admit() {
                    returned.push(message.ack_handle);
                    continue;
                }
                log::debug!(
                    "Received message {} ({}) with attributes {:?}",
                    message.message_id,
                    message.ack_handle,
                    message.attributes
                );
                self.dispatch(handler, message, shutdown, supervisors).await;
            }
            if !returned.is_empty() {
                report.nacked += returned.len() as u64;
                self.return_to_broker(&returned).await;
            }
        }
    }

    /// Delay before the next pull, or the error that stops the consumer
    fn pull_backoff(
        &self,
        error: &BrokerError,
        failing_since: Instant,
        retry: u32,
    ) -> SubscribeResult<Duration> {
        let decision = if error.is_transient() {
            self.settings
                .pull_retry
                .decide(error.class, failing_since.elapsed(), retry)
        } else {
            RetryDecision::GiveUp
        };
        match decision {
            RetryDecision::Retry(delay) => Ok(delay),
            RetryDecision::GiveUp => {
                log::error!("Giving up pulling from {}: {}", self.subscription, error);
                Err(SubscribeError::Pull {
                    subscription: self.subscription.path(),
                    source: error.clone(),
                })
            }
        }
    }

    async fn dispatch<H, Fut>(
        &self,
        handler: &H,
        message: InboundMessage,
        shutdown: &ShutdownCoordinator,
        supervisors: &mut JoinSet<Settlement>,
    ) where
        H: Fn(InboundMessage, ShutdownCoordinator) -> Fut,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let ack_handle = message.ack_handle.clone();
        let worker = tokio::spawn(handler(message.clone(), shutdown.clone()));

        // Registered before anyone awaits the worker, so settlement always
        // finds the entry.
        if !self.lease.register(&message, worker.abort_handle()).await {
            worker.abort();
            self.flow.release();
            return;
        }
        supervisors.spawn(supervise(Arc::clone(&self.lease), worker, ack_handle));
    }

    /// Make undispatched messages available for redelivery right away
    async fn return_to_broker(&self, handles: &[AckHandle]) {
        log::debug!(
            "Returning {} undispatched message(s) to {}",
            handles.len(),
            self.subscription
        );
        if let Err(e) = self
            .client
            .modify_ack_deadline(&self.subscription, handles, 0)
            .await
        {
            log::warn!(
                "Could not return {} message(s) to {}: {}",
                handles.len(),
                self.subscription,
                e
            );
        }
    }

    fn emit(&self, event_type: ConsumerEventType) {
        self.events.publish(Event::Consumer(ConsumerEvent::new(
            event_type,
            self.subscription.path(),
        )));
    }

    fn emit_with_outstanding(&self, event_type: ConsumerEventType) {
        self.events
            .publish(Event::Consumer(ConsumerEvent::with_outstanding(
                event_type,
                self.subscription.path(),
                self.flow.outstanding(),
            )));
    }
}

/// Await a worker and settle its lease according to the result
async fn supervise(
    lease: Arc<LeaseManager>,
    worker: JoinHandle<Result<(), WorkerError>>,
    ack_handle: AckHandle,
) -> Settlement {
    match worker.await {
        Ok(Ok(())) => Settlement {
            outcome: lease.complete(&ack_handle).await,
            worker_failed: false,
        },
        Ok(Err(WorkerError::Cancelled)) => Settlement {
            outcome: lease.abandon(&ack_handle, "worker cancelled").await,
            worker_failed: false,
        },
        Ok(Err(e)) => {
            log::warn!("Worker for {} failed: {}", ack_handle, e);
            Settlement {
                outcome: lease.abandon(&ack_handle, &e.to_string()).await,
                worker_failed: true,
            }
        }
        Err(e) if e.is_cancelled() => Settlement {
            outcome: lease.abandon(&ack_handle, "worker aborted").await,
            worker_failed: false,
        },
        Err(e) => {
            log::warn!("Worker for {} panicked: {}", ack_handle, e);
            Settlement {
                outcome: lease.abandon(&ack_handle, "worker panicked").await,
                worker_failed: true,
            }
        }
    }
}
