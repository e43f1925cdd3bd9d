//! Shutdown and Cancellation Coordination
//!
//! [`ShutdownCoordinator`] is the cancellation token shared by the consumer's
//! pull loop, its workers, the lease-extension ticker and pending publish
//! retries. It is cheap to clone; every clone observes the same state.
//! Signal handling for the binary and timeout-triggered cancellation are
//! layered on top of the same token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinates graceful shutdown across the application
#[derive(Clone, Debug)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_requested: Arc<AtomicBool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Create a new, untriggered coordinator
    pub fn new() -> Self {
        // Use a larger channel to avoid dropping bursts of shutdown signals
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            shutdown_tx,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger shutdown
    pub fn trigger_shutdown(&self) {
        // Release pairs with the Acquire load in is_shutdown_requested()
        self.shutdown_requested.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Resolve once shutdown has been requested
    ///
    /// Subscribes before checking the flag so a trigger racing with this
    /// call is never missed.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        while !self.is_shutdown_requested() {
            match rx.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                // The sender lives in self, so the channel cannot close here
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Trigger shutdown once `timeout` has elapsed, unless already triggered
    ///
    /// Used to bound a receive or publish run by a caller-supplied timeout:
    /// exceeding it cancels the pending work rather than raising an error.
    pub fn trigger_after(&self, timeout: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    log::debug!("Timeout of {:?} reached; requesting shutdown", timeout);
                    coordinator.trigger_shutdown();
                }
                _ = coordinator.cancelled() => {}
            }
        })
    }

    /// Coordinator that is triggered together with this one but can also be
    /// triggered on its own
    ///
    /// Scopes a timeout to one operation: triggering the child never affects
    /// the parent. Must be called from within a tokio runtime.
    pub fn child(&self) -> ShutdownCoordinator {
        let child = ShutdownCoordinator::new();
        child.follow(self);
        child
    }

    /// Trigger this coordinator as soon as `parent` is triggered
    ///
    /// A coordinator may follow several parents. The watcher task ends when
    /// either side is triggered. Must be called from within a tokio runtime.
    pub fn follow(&self, parent: &ShutdownCoordinator) {
        if parent.is_shutdown_requested() {
            self.trigger_shutdown();
            return;
        }
        let parent = parent.clone();
        let scoped = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => scoped.trigger_shutdown(),
                _ = scoped.cancelled() => {}
            }
        });
    }

    /// Install process signal handlers that trigger this coordinator
    ///
    /// The first SIGINT/SIGTERM/SIGHUP/SIGQUIT requests a graceful shutdown;
    /// a second one exits the process immediately.
    pub fn install_signal_handlers(&self) {
        setup_signal_handlers(self.shutdown_tx.clone(), self.shutdown_requested.clone());
    }
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown_tx: broadcast::Sender<()>, shutdown_requested: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }

        use std::sync::atomic::AtomicUsize;
        use tokio::signal::unix::{signal, SignalKind};
        let signal_count = Arc::new(AtomicUsize::new(0));
        let signals = [
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::hangup(),
            SignalKind::quit(),
        ];

        for kind in signals {
            let tx = shutdown_tx.clone();
            let requested = shutdown_requested.clone();
            let sig_ctr = signal_count.clone();

            tokio::spawn(async move {
                if let Ok(mut sig) = signal(kind) {
                    while sig.recv().await.is_some() {
                        let prev = sig_ctr.fetch_add(1, Ordering::AcqRel);
                        requested.store(true, Ordering::Release);
                        let _ = tx.send(());
                        if prev >= 1 {
                            log::warn!("Second shutdown signal received; exiting");
                            std::process::exit(130);
                        }
                        log::info!("Shutdown requested; finishing in-flight work");
                    }
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let mut received = 0usize;
            while tokio::signal::ctrl_c().await.is_ok() {
                received += 1;
                shutdown_requested.store(true, Ordering::Release);
                let _ = shutdown_tx.send(());
                if received > 1 {
                    std::process::exit(130);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_coordinator_creation() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_shutdown_coordinator_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        coordinator.trigger_shutdown();

        assert!(coordinator.is_shutdown_requested());
        let signal_received = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(signal_received.is_ok(), "Should receive shutdown signal");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let coordinator = ShutdownCoordinator::new();
        let clone = coordinator.clone();
        clone.trigger_shutdown();
        assert!(coordinator.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        coordinator.trigger_shutdown();

        let result = timeout(Duration::from_millis(200), task).await;
        assert!(result.is_ok(), "cancelled() should resolve once triggered");
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_triggered() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger_shutdown();
        let result = timeout(Duration::from_millis(50), coordinator.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_child_follows_parent_but_not_the_reverse() {
        let parent = ShutdownCoordinator::new();
        let first = parent.child();
        first.trigger_shutdown();
        assert!(first.is_shutdown_requested());
        assert!(!parent.is_shutdown_requested());

        let second = parent.child();
        parent.trigger_shutdown();
        let result = timeout(Duration::from_millis(200), second.cancelled()).await;
        assert!(result.is_ok());
        assert!(second.is_shutdown_requested());

        assert!(parent.child().is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_follow_triggers_on_any_parent() {
        let first = ShutdownCoordinator::new();
        let second = ShutdownCoordinator::new();
        let scoped = first.child();
        scoped.follow(&second);

        second.trigger_shutdown();
        let result = timeout(Duration::from_millis(200), scoped.cancelled()).await;
        assert!(result.is_ok());
        assert!(!first.is_shutdown_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_after_timeout() {
        let coordinator = ShutdownCoordinator::new();
        let timer = coordinator.trigger_after(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!coordinator.is_shutdown_requested());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(coordinator.is_shutdown_requested());
        timer.await.unwrap();
    }
}
