//! Batch accumulation
//!
//! Messages are buffered until the first of three bounds is reached: total
//! bytes, message count, or age of the oldest buffered message. Completed
//! batches are handed out in the order their bound was reached.

use crate::core::sync::handle_mutex_poison;
use crate::core::validation::{require_positive, require_positive_seconds, ConfigResult};
use crate::publisher::error::{PublishError, PublishResult};
use crate::publisher::message::{Batch, OutboundMessage};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Flush thresholds for a [`BatchAccumulator`]
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub max_bytes: usize,
    pub max_messages: usize,
    pub max_latency: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1024,
            max_messages: 10,
            max_latency: Duration::from_secs(1),
        }
    }
}

impl BatchSettings {
    pub fn validate(&self) -> ConfigResult<()> {
        require_positive("max_bytes", self.max_bytes)?;
        require_positive("max_messages", self.max_messages)?;
        require_positive_seconds("max_latency", self.max_latency.as_secs_f64())
    }
}

#[derive(Debug, Default)]
struct AccumulatorState {
    current: Option<Batch>,
    /// Completed batches not yet handed out
    ready: VecDeque<Batch>,
}

/// Size/count/latency-triggered message buffer
#[derive(Debug)]
pub struct BatchAccumulator {
    settings: BatchSettings,
    state: Mutex<AccumulatorState>,
}

impl BatchAccumulator {
    /// Create an accumulator; fails if any bound is not positive
    pub fn new(settings: BatchSettings) -> ConfigResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            state: Mutex::new(AccumulatorState::default()),
        })
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Buffer a message, returning a batch if a bound was met or exceeded
    ///
    /// A buffer that is already stale, or that the new message would push
    /// past `max_bytes`, is completed before the message is buffered. A
    /// message that is larger than `max_bytes` by itself becomes a batch of
    /// one. When a single call completes two batches the second one is
    /// available from [`take_ready`](Self::take_ready).
    pub fn add(&self, message: OutboundMessage) -> PublishResult<Option<Batch>> {
        let now = Instant::now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        if let Some(current) = state.current.as_ref() {
            let stale = current.age(now) >= self.settings.max_latency;
            let overflow = current.bytes() + message.size() > self.settings.max_bytes;
            if stale || overflow {
                if let Some(done) = state.current.take() {
                    state.ready.push_back(done);
                }
            }
        }

        match state.current.as_mut() {
            Some(current) => current.push(message),
            None => state.current = Some(Batch::start(message, now)),
        }

        if state.current.as_ref().is_some_and(|b| self.is_full(b)) {
            if let Some(done) = state.current.take() {
                state.ready.push_back(done);
            }
        }

        Ok(state.ready.pop_front())
    }

    /// Next completed batch that [`add`](Self::add) could not return
    pub fn take_ready(&self) -> PublishResult<Option<Batch>> {
        Ok(self.lock()?.ready.pop_front())
    }

    /// Time-triggered flush
    ///
    /// Returns a pending completed batch if there is one, otherwise the
    /// buffer if its age has reached `max_latency`.
    pub fn flush_if_stale(&self, now: Instant) -> PublishResult<Option<Batch>> {
        let mut state = self.lock()?;
        if let Some(ready) = state.ready.pop_front() {
            return Ok(Some(ready));
        }
        let stale = state
            .current
            .as_ref()
            .is_some_and(|b| b.age(now) >= self.settings.max_latency);
        Ok(if stale { state.current.take() } else { None })
    }

    /// Hand out everything buffered, completed batches first
    pub fn flush(&self) -> PublishResult<Vec<Batch>> {
        let mut state = self.lock()?;
        let mut batches: Vec<Batch> = state.ready.drain(..).collect();
        batches.extend(state.current.take());
        Ok(batches)
    }

    /// Number of messages buffered, completed or not
    pub fn pending_messages(&self) -> PublishResult<usize> {
        let state = self.lock()?;
        Ok(state.ready.iter().map(Batch::len).sum::<usize>()
            + state.current.as_ref().map_or(0, Batch::len))
    }

    fn is_full(&self, batch: &Batch) -> bool {
        batch.len() >= self.settings.max_messages || batch.bytes() >= self.settings.max_bytes
    }

    fn lock(&self) -> PublishResult<MutexGuard<'_, AccumulatorState>> {
        handle_mutex_poison(self.state.lock(), |msg| PublishError::Internal { message: msg })
    }
}
