//! Flow control
//!
//! [`FlowController`] bounds the number of admitted, not yet settled
//! messages. Admission and release are single atomic updates, so the bound
//! holds without a lock.

use crate::core::validation::{require_positive, ConfigResult};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Admission counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    pub outstanding: usize,
    pub admitted: u64,
    pub released: u64,
}

/// Caps concurrently outstanding messages
#[derive(Debug)]
pub struct FlowController {
    max_outstanding: usize,
    outstanding: AtomicUsize,
    admitted: AtomicU64,
    released: AtomicU64,
    capacity_freed: Notify,
}

impl FlowController {
    pub fn new(max_outstanding: usize) -> ConfigResult<Self> {
        require_positive("max_outstanding", max_outstanding)?;
        Ok(Self {
            max_outstanding,
            outstanding: AtomicUsize::new(0),
            admitted: AtomicU64::new(0),
            released: AtomicU64::new(0),
            capacity_freed: Notify::new(),
        })
    }

    /// Take one slot if the budget allows it
    pub fn try_admit(&self) -> bool {
        let admitted = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_outstanding).then_some(current + 1)
            })
            .is_ok();
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        }
        admitted
    }

    /// Return one slot; called once per admitted message
    pub fn release(&self) {
        let released = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok();
        if released {
            self.released.fetch_add(1, Ordering::Relaxed);
            self.capacity_freed.notify_waiters();
        } else {
            log::error!("Flow budget released without a matching admission");
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.max_outstanding.saturating_sub(self.outstanding())
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Wait until at least one slot is free
    ///
    /// Woken by [`release`](Self::release); re-checks at least every `poll`.
    pub async fn wait_for_capacity(&self, poll: Duration) {
        loop {
            let freed = self.capacity_freed.notified();
            if self.available() > 0 {
                return;
            }
            tokio::select! {
                _ = freed => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    pub fn stats(&self) -> FlowStats {
        FlowStats {
            outstanding: self.outstanding(),
            admitted: self.admitted.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}
