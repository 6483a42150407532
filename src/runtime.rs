//! Replication runtime plumbing: async-task accounting with an idle signal,
//! and shutdown coordination shared by the worker, the change tracker, and
//! in-flight fetch tasks.

// src/runtime.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Counts logical async tasks (catch-up wait, tracker run, each fetch, each
/// queued insert). Every `started` must be balanced by exactly one unit of
/// `finished` on every exit path; `wait_idle` resolves when the count is zero.
#[derive(Clone, Debug)]
pub struct TaskCounter {
    tx: watch::Sender<usize>,
    rx: watch::Receiver<usize>,
}

impl TaskCounter {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(0usize);
        Self { tx, rx }
    }

    pub fn started(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    pub fn finished(&self, count: usize) {
        self.tx.send_modify(|n| {
            if *n < count {
                log::warn!(
                    "task counter underflow: finishing {} with {} pending",
                    count,
                    *n
                );
                *n = 0;
            } else {
                *n -= count;
            }
        });
    }

    pub fn pending(&self) -> usize {
        *self.rx.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until every started task has finished.
    pub async fn wait_idle(&self) {
        let mut rx = self.rx.clone();
        // The channel sender lives in self, so wait_for cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown coordination for a replication run.
///
/// Clone the receiver into background tasks; trigger programmatically from
/// the owner or from a task hitting a fatal error.
#[derive(Clone)]
pub struct PullRuntime {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    fatal_error: Arc<AtomicBool>,
}

impl PullRuntime {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            fatal_error: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receiver to watch for shutdown; clone into background tasks.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown caused by an unrecoverable error; the run reports it instead
    /// of a clean stop.
    pub fn trigger_fatal_shutdown(&self) {
        self.fatal_error.store(true, Ordering::Relaxed);
        self.trigger_shutdown();
    }

    pub fn is_fatal_shutdown(&self) -> bool {
        self.fatal_error.load(Ordering::Relaxed)
    }
}

impl Default for PullRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, sleep, timeout};

    #[tokio::test]
    async fn test_counter_balances() {
        let counter = TaskCounter::new();
        counter.started();
        counter.started();
        counter.started();
        assert_eq!(counter.pending(), 3);
        counter.finished(2);
        assert_eq!(counter.pending(), 1);
        counter.finished(1);
        assert!(counter.is_idle());
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_finish() {
        let counter = TaskCounter::new();
        counter.started();

        let waiter = counter.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_idle().await;
        });

        sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        counter.finished(1);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait_idle should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_underflow_clamps_to_zero() {
        let counter = TaskCounter::new();
        counter.started();
        counter.finished(5);
        assert!(counter.is_idle());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let runtime = PullRuntime::new();
        let mut rx = runtime.shutdown_signal();
        assert!(!runtime.is_shutdown());

        runtime.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(!runtime.is_fatal_shutdown());
    }

    #[tokio::test]
    async fn test_fatal_shutdown() {
        let runtime = PullRuntime::new();
        runtime.trigger_fatal_shutdown();
        assert!(runtime.is_shutdown());
        assert!(runtime.is_fatal_shutdown());
    }
}
