//! Tracks spawned non-blocking action tasks and coordinates their shutdown.
//!
//! A `tokio::task::JoinSet` owns the tasks; a `watch` channel broadcasts the
//! shutdown signal to every task currently running, and `Atomic*` counters
//! expose liveness for tests and status reporting without needing to lock
//! anything.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::warn;

/// Number of outstanding tasks above which [`TaskContainer::reap_finished`]
/// is worth calling proactively (mirrors the original agent's threshold for
/// starting its monitoring thread).
pub const TASKS_THRESHOLD: u64 = 10;

/// Owns the spawned task set for non-blocking actions and the shutdown
/// signal they all watch.
pub struct TaskContainer {
    name: String,
    join_set: JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    added: AtomicU64,
    erased: AtomicU64,
    is_monitoring: AtomicBool,
}

impl TaskContainer {
    /// Build an empty container labeled `name` (used only in log lines).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            name: name.into(),
            join_set: JoinSet::new(),
            shutdown_tx,
            shutdown_rx,
            added: AtomicU64::new(0),
            erased: AtomicU64::new(0),
            is_monitoring: AtomicBool::new(false),
        }
    }

    /// A receiver that fires once [`TaskContainer::shutdown`] has been
    /// called, for tasks to watch with `tokio::select!`.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> { self.shutdown_rx.clone() }

    /// Spawn `future` as a tracked task. The task is expected to observe a
    /// cloned [`TaskContainer::shutdown_signal`] and exit promptly once it
    /// fires.
    pub fn add<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.join_set.spawn(future);
        self.added.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(container = %self.name, total_added = self.num_added(), "task added");
    }

    /// Join any tasks that have already finished, without blocking on ones
    /// that have not. Updates the erased counter for each one reaped.
    pub async fn reap_finished(&mut self) {
        while let Some(result) = self.join_set.try_join_next() {
            if let Err(join_err) = result {
                warn!(container = %self.name, error = %join_err, "task panicked");
            }
            self.erased.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Broadcast the shutdown signal and wait for every tracked task to
    /// finish.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.is_monitoring.store(true, Ordering::Relaxed);
        while let Some(result) = self.join_set.join_next().await {
            if let Err(join_err) = result {
                warn!(container = %self.name, error = %join_err, "task panicked during shutdown");
            }
            self.erased.fetch_add(1, Ordering::Relaxed);
        }
        self.is_monitoring.store(false, Ordering::Relaxed);
    }

    /// Whether a drain (via [`TaskContainer::shutdown`]) or a background
    /// reaper (started via [`TaskContainer::start_monitoring`]) is currently
    /// active.
    #[must_use]
    pub fn is_monitoring(&self) -> bool { self.is_monitoring.load(Ordering::Relaxed) }

    /// Mark the container as being actively monitored by a background
    /// reaper task. Callers spawn that task themselves once
    /// [`TaskContainer::num_outstanding`] crosses [`TASKS_THRESHOLD`]; this
    /// flag exists purely so a second reaper isn't spawned concurrently.
    pub fn start_monitoring(&mut self) { self.is_monitoring.store(true, Ordering::Relaxed); }

    /// Clear the monitoring flag once the background reaper has brought
    /// [`TaskContainer::num_outstanding`] back under [`TASKS_THRESHOLD`] and
    /// stopped itself.
    pub fn stop_monitoring(&mut self) { self.is_monitoring.store(false, Ordering::Relaxed); }

    /// Total tasks ever added to this container.
    #[must_use]
    pub fn num_added(&self) -> u64 { self.added.load(Ordering::Relaxed) }

    /// Total tasks reaped so far, whether by [`TaskContainer::reap_finished`]
    /// or [`TaskContainer::shutdown`].
    #[must_use]
    pub fn num_erased(&self) -> u64 { self.erased.load(Ordering::Relaxed) }

    /// Tasks added but not yet reaped.
    #[must_use]
    pub fn num_outstanding(&self) -> u64 { self.num_added().saturating_sub(self.num_erased()) }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Notify;
    use tokio::time::Duration;

    use super::*;

    #[tokio::test]
    async fn add_and_reap_tracks_counters() {
        let mut container = TaskContainer::new("test");
        container.add(async {});
        assert_eq!(container.num_added(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        container.reap_finished().await;
        assert_eq!(container.num_erased(), 1);
        assert_eq!(container.num_outstanding(), 0);
    }

    #[tokio::test]
    async fn shutdown_signal_wakes_spawned_task() {
        let mut container = TaskContainer::new("test");
        let notify = Arc::new(Notify::new());
        let notify_clone = Arc::clone(&notify);
        let mut shutdown = container.shutdown_signal();
        container.add(async move {
            let _ = shutdown.changed().await;
            notify_clone.notify_one();
        });
        container.shutdown().await;
        notify.notified().await;
        assert_eq!(container.num_outstanding(), 0);
    }
}
