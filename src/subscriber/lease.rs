//! Lease management
//!
//! Every admitted message has exactly one [`LeaseEntry`] from registration
//! until it is acknowledged or abandoned. The entry table is guarded by one
//! async mutex. Settling removes the entry under the lock before the broker
//! is told, and an extension only picks entries present under the lock, so
//! no extension starts for a settled handle. The lock is never held across
//! a broker call.
//!
//! ```text
//! Received ──register──▶ Leased ──complete──▶ Acknowledged
//!                          │  ▲
//!                   tick   └──┘ extend       ──abandon──▶ Abandoned
//! ```

use crate::broker::api::{AckHandle, BrokerClient, BrokerResult, SubscriptionHandle};
use crate::core::shutdown::ShutdownCoordinator;
use crate::notifications::api::{Event, EventBus, LeaseEvent, LeaseEventType};
use crate::subscriber::flow::FlowController;
use crate::subscriber::message::InboundMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// How a lease ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acknowledged,
    /// Not acknowledged; the broker redelivers after the deadline passes
    Abandoned,
    /// No lease for the handle: never registered or already settled
    NotLeased,
}

#[derive(Debug)]
struct LeaseEntry {
    worker: AbortHandle,
    deadline: Instant,
    registered_at: Instant,
    extensions: u32,
    /// Held past the maximum lease; no longer extended
    expired: bool,
}

/// Lease counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseStats {
    pub registered: u64,
    pub acknowledged: u64,
    pub abandoned: u64,
    pub extensions: u64,
    pub expired: u64,
}

#[derive(Debug, Default)]
struct LeaseCounters {
    registered: AtomicU64,
    acknowledged: AtomicU64,
    abandoned: AtomicU64,
    extensions: AtomicU64,
    expired: AtomicU64,
}

/// Returns one flow slot when dropped
struct FlowSlot<'a>(&'a FlowController);

impl Drop for FlowSlot<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Tracks in-flight messages and keeps their ack deadlines alive
pub struct LeaseManager {
    client: Arc<dyn BrokerClient>,
    subscription: SubscriptionHandle,
    ack_deadline_seconds: u32,
    max_lease: Duration,
    flow: Arc<FlowController>,
    events: EventBus,
    entries: Mutex<HashMap<AckHandle, LeaseEntry>>,
    counters: LeaseCounters,
}

impl LeaseManager {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        subscription: SubscriptionHandle,
        ack_deadline_seconds: u32,
        max_lease: Duration,
        flow: Arc<FlowController>,
        events: EventBus,
    ) -> Self {
        Self {
            client,
            subscription,
            ack_deadline_seconds,
            max_lease,
            flow,
            events,
            entries: Mutex::new(HashMap::new()),
            counters: LeaseCounters::default(),
        }
    }

    fn ack_deadline(&self) -> Duration {
        Duration::from_secs(u64::from(self.ack_deadline_seconds))
    }

    /// Start tracking a message whose worker is running
    ///
    /// Returns `false` if the handle is already leased; the existing lease
    /// is left untouched.
    pub async fn register(&self, message: &InboundMessage, worker: AbortHandle) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&message.ack_handle) {
            log::warn!(
                "Ack handle {} is already leased; ignoring duplicate registration",
                message.ack_handle
            );
            return false;
        }
        entries.insert(
            message.ack_handle.clone(),
            LeaseEntry {
                worker,
                deadline: now + self.ack_deadline(),
                registered_at: now,
                extensions: 0,
                expired: false,
            },
        );
        drop(entries);

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Leased {} (message {}) for {}s",
            message.ack_handle,
            message.message_id,
            self.ack_deadline_seconds
        );
        self.emit(LeaseEventType::Leased, &message.ack_handle, None);
        true
    }

    /// Extend the deadline of every lease whose worker is still running
    ///
    /// Returns the number of leases extended.
    pub async fn extend_once(&self) -> BrokerResult<usize> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let mut handles = Vec::new();
        for (handle, entry) in entries.iter_mut() {
            if entry.worker.is_finished() || entry.expired {
                continue;
            }
            if now.saturating_duration_since(entry.registered_at) >= self.max_lease {
                entry.expired = true;
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Lease for {} held longer than {}s; no further extensions",
                    handle,
                    self.max_lease.as_secs()
                );
                self.emit(LeaseEventType::Expired, handle, None);
                continue;
            }
            handles.push(handle.clone());
        }
        drop(entries);
        if handles.is_empty() {
            return Ok(0);
        }
        handles.sort();

        self.client
            .modify_ack_deadline(&self.subscription, &handles, self.ack_deadline_seconds)
            .await?;

        // Entries settled while the call was pending are gone and stay gone
        let mut entries = self.entries.lock().await;
        let mut extended = 0;
        for handle in &handles {
            let Some(entry) = entries.get_mut(handle) else {
                continue;
            };
            entry.deadline = now + self.ack_deadline();
            entry.extensions += 1;
            extended += 1;
            log::info!(
                "Reset ack deadline for {} for {}s",
                handle,
                self.ack_deadline_seconds
            );
            self.emit(LeaseEventType::Extended, handle, None);
        }
        drop(entries);
        self.counters
            .extensions
            .fetch_add(extended as u64, Ordering::Relaxed);
        Ok(extended)
    }

    /// Periodically extend leases until `shutdown` is triggered
    ///
    /// The first extension happens one `tick` after the loop starts.
    pub async fn extend_loop(self: Arc<Self>, tick: Duration, shutdown: ShutdownCoordinator) {
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::debug!(
            "Lease extension loop for {} started (every {:.3}s)",
            self.subscription,
            tick.as_secs_f64()
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        extended = self.extend_once() => {
                            if let Err(e) = extended {
                                log::warn!("Failed to extend leases on {}: {}", self.subscription, e);
                            }
                        }
                    }
                }
            }
        }
        log::debug!("Lease extension loop for {} stopped", self.subscription);
    }

    /// Acknowledge a message whose worker succeeded
    ///
    /// If the broker rejects the acknowledgment the lease is abandoned and
    /// the message will be redelivered. The flow slot is returned once the
    /// broker answers, or when this future is dropped before it does.
    pub async fn complete(&self, ack_handle: &AckHandle) -> LeaseOutcome {
        let removed = self.entries.lock().await.remove(ack_handle);
        let Some(entry) = removed else {
            log::debug!("Ignoring completion for {}: not leased", ack_handle);
            return LeaseOutcome::NotLeased;
        };
        let slot = FlowSlot(&self.flow);
        let result = self
            .client
            .acknowledge(&self.subscription, std::slice::from_ref(ack_handle))
            .await;
        drop(slot);

        match result {
            Ok(()) => {
                self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Acknowledged {} after {:.3}s ({} extension(s))",
                    ack_handle,
                    entry.registered_at.elapsed().as_secs_f64(),
                    entry.extensions
                );
                self.emit(LeaseEventType::Acknowledged, ack_handle, None);
                LeaseOutcome::Acknowledged
            }
            Err(e) => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Abandoned {}: acknowledge failed ({}); the broker will redeliver",
                    ack_handle,
                    e
                );
                self.emit(LeaseEventType::Abandoned, ack_handle, Some(e.to_string()));
                LeaseOutcome::Abandoned
            }
        }
    }

    /// Give up a message without acknowledging it
    pub async fn abandon(&self, ack_handle: &AckHandle, reason: &str) -> LeaseOutcome {
        let removed = self.entries.lock().await.remove(ack_handle);
        if removed.is_none() {
            log::debug!("Ignoring abandonment for {}: not leased", ack_handle);
            return LeaseOutcome::NotLeased;
        }
        self.flow.release();
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        log::warn!("Abandoned {}: {}", ack_handle, reason);
        self.emit(LeaseEventType::Abandoned, ack_handle, Some(reason.to_string()));
        LeaseOutcome::Abandoned
    }

    /// Abandon every remaining lease
    pub async fn abandon_all(&self, reason: &str) -> usize {
        let drained: Vec<AckHandle> = self.entries.lock().await.drain().map(|(h, _)| h).collect();
        for handle in &drained {
            self.flow.release();
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            log::warn!("Abandoned {}: {}", handle, reason);
            self.emit(LeaseEventType::Abandoned, handle, Some(reason.to_string()));
        }
        drained.len()
    }

    /// Abort every worker that is still running; returns how many were aborted
    pub async fn abort_workers(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|entry| !entry.worker.is_finished())
            .map(|entry| entry.worker.abort())
            .count()
    }

    pub async fn outstanding(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_leased(&self, ack_handle: &AckHandle) -> bool {
        self.entries.lock().await.contains_key(ack_handle)
    }

    /// Current local deadline of a lease
    pub async fn deadline(&self, ack_handle: &AckHandle) -> Option<Instant> {
        self.entries.lock().await.get(ack_handle).map(|e| e.deadline)
    }

    pub fn stats(&self) -> LeaseStats {
        LeaseStats {
            registered: self.counters.registered.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            extensions: self.counters.extensions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    pub fn subscription(&self) -> &SubscriptionHandle {
        &self.subscription
    }

    fn emit(&self, event_type: LeaseEventType, ack_handle: &AckHandle, message: Option<String>) {
        let subscription = self.subscription.path();
        let event = match message {
            Some(message) => {
                LeaseEvent::with_message(event_type, subscription, ack_handle.to_string(), message)
            }
            None => LeaseEvent::new(event_type, subscription, ack_handle.to_string()),
        };
        self.events.publish(Event::Lease(event));
    }
}
