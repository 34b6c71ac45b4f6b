//! Generic controller loop: wait for dependency caches, then drain a work
//! queue into a [`Reconciler`] and decide what to do with each failure.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::Synced;
use crate::error::{Disposition, Error, Result};
use crate::queue::WorkQueue;

/// A unit of work: reconcile a key, or tear down what it owned.
///
/// `Sync(k)` and `Delete(k)` are distinct queue entries, so with more than
/// one worker both may run for the same key at once. Reconcilers tolerate
/// this: a delete only acts once the object is gone from the cache, and a
/// sync of a vanished object does nothing, so any write a racing sync makes
/// raises an event that brings the delete back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    Sync(String),
    Delete(String),
}

impl Request {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Request::Sync(k) | Request::Delete(k) => k,
        }
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Converge the object named by `key`.
    async fn sync(&self, key: &str) -> Result<()>;

    /// Clean up after the object named by `key` is gone.
    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    WaitingForSync,
    Running,
    ShuttingDown,
}

/// Releases a queue item when processing ends, however it ends.
struct DoneGuard {
    queue: WorkQueue<Request>,
    request: Request,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.queue.done(&self.request);
    }
}

#[derive(Clone)]
pub struct Controller {
    name: String,
    queue: WorkQueue<Request>,
    reconciler: Arc<dyn Reconciler>,
    dependencies: Vec<Arc<dyn Synced>>,
    retry_delay: Duration,
    sync_poll_interval: Duration,
    workers: usize,
    phase: Arc<Mutex<ControllerPhase>>,
}

impl Controller {
    pub fn new(name: &str, reconciler: Arc<dyn Reconciler>, queue: WorkQueue<Request>) -> Self {
        Self {
            name: name.to_string(),
            queue,
            reconciler,
            dependencies: Vec::new(),
            retry_delay: Duration::from_millis(200),
            sync_poll_interval: Duration::from_millis(200),
            workers: 1,
            phase: Arc::new(Mutex::new(ControllerPhase::WaitingForSync)),
        }
    }

    /// Do not start processing until `cache` has synced.
    #[must_use]
    pub fn with_dependency(mut self, cache: Arc<dyn Synced>) -> Self {
        self.dependencies.push(cache);
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_sync_poll_interval(mut self, interval: Duration) -> Self {
        self.sync_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &WorkQueue<Request> {
        &self.queue
    }

    pub fn phase(&self) -> ControllerPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: ControllerPhase) {
        *self.phase.lock() = phase;
    }

    /// True once every dependency cache has synced.
    pub fn dependencies_synced(&self) -> bool {
        self.dependencies.iter().all(|d| d.has_synced())
    }

    /// Run until `shutdown` fires and in-flight work has finished.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(controller = %self.name, "Waiting for dependency caches");
        if !self.wait_for_sync(&shutdown).await {
            self.set_phase(ControllerPhase::ShuttingDown);
            self.queue.shut_down();
            info!(controller = %self.name, "Stopped before caches synced");
            return;
        }

        self.set_phase(ControllerPhase::Running);
        info!(controller = %self.name, workers = self.workers, "Controller running");

        let workers: Vec<_> = (0..self.workers)
            .map(|_| {
                let this = self.clone();
                tokio::spawn(async move { while this.process_next().await {} })
            })
            .collect();

        shutdown.cancelled().await;
        self.set_phase(ControllerPhase::ShuttingDown);
        info!(controller = %self.name, "Shutting down controller");
        self.queue.shut_down();

        for worker in workers {
            if let Err(e) = worker.await {
                error!(controller = %self.name, error = %e, "Worker task failed");
            }
        }
        info!(controller = %self.name, "Controller stopped");
    }

    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if self.dependencies_synced() {
                return true;
            }
            tokio::select! {
                () = shutdown.cancelled() => return false,
                () = tokio::time::sleep(self.sync_poll_interval) => {}
            }
        }
    }

    /// Handle one queue item. Returns false when the queue is shutting down.
    pub async fn process_next(&self) -> bool {
        let Some(request) = self.queue.get().await else {
            return false;
        };
        let _done = DoneGuard {
            queue: self.queue.clone(),
            request: request.clone(),
        };

        let reconciler = self.reconciler.clone();
        let work = {
            let request = request.clone();
            async move {
                match &request {
                    Request::Sync(key) => reconciler.sync(key).await,
                    Request::Delete(key) => reconciler.delete(key).await,
                }
            }
        };

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(())) => {
                debug!(controller = %self.name, request = ?request, "Reconciled");
            }
            Ok(Err(err)) => self.handle_error(&request, &err),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    controller = %self.name,
                    request = ?request,
                    panic = %message,
                    "Reconciler panicked, dropping request"
                );
            }
        }
        true
    }

    fn handle_error(&self, request: &Request, err: &Error) {
        match err.disposition() {
            Disposition::Requeue(delay) => {
                let delay = delay.unwrap_or(self.retry_delay);
                warn!(
                    controller = %self.name,
                    request = ?request,
                    error = %err,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconcile failed, requeueing"
                );
                self.queue.add_after(request.clone(), delay);
            }
            Disposition::Drop => {
                error!(
                    controller = %self.name,
                    request = ?request,
                    error = %err,
                    "Reconcile failed, dropping request"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Flag(AtomicBool);

    impl Synced for Flag {
        fn has_synced(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
        fn name(&self) -> &str {
            "flag"
        }
    }

    /// Fails according to the key, counting calls.
    #[derive(Default)]
    struct Scripted {
        calls: AtomicUsize,
        deletes: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for Scripted {
        async fn sync(&self, key: &str) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            match key {
                "not-ready" if n == 0 => Err(Error::not_ready("pvc")),
                "conflict" if n == 0 => Err(Error::Store(StoreError::Conflict("x".into()))),
                "invalid" => Err(Error::invalid("no pinned host")),
                "panic" => panic!("boom"),
                _ => Ok(()),
            }
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn controller(reconciler: Arc<Scripted>) -> Controller {
        Controller::new("test", reconciler, WorkQueue::new())
            .with_retry_delay(Duration::from_millis(200))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_is_requeued() {
        let r = Arc::new(Scripted::default());
        let c = controller(r.clone());
        c.queue().add(Request::Sync("not-ready".into()));

        assert!(c.process_next().await);
        assert_eq!(c.queue().delayed_len(), 1);
        assert!(c.process_next().await);
        assert_eq!(r.calls.load(Ordering::SeqCst), 2);
        assert!(c.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_always_requeued() {
        let r = Arc::new(Scripted::default());
        let c = controller(r.clone());
        c.queue().add(Request::Sync("conflict".into()));
        assert!(c.process_next().await);
        assert_eq!(c.queue().delayed_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_and_panic_are_dropped() {
        let r = Arc::new(Scripted::default());
        let c = controller(r.clone());
        c.queue().add(Request::Sync("invalid".into()));
        c.queue().add(Request::Sync("panic".into()));
        assert!(c.process_next().await);
        assert!(c.process_next().await);
        assert_eq!(c.queue().delayed_len(), 0);
        assert!(c.queue().is_empty());

        // The panicking key was released and can be delivered again.
        c.queue().add(Request::Sync("panic".into()));
        assert_eq!(c.queue().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_requests_dispatch_to_delete() {
        let r = Arc::new(Scripted::default());
        let c = controller(r.clone());
        c.queue().add(Request::Delete("uid-1".into()));
        assert!(c.process_next().await);
        assert_eq!(r.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_dependencies_then_runs() {
        let r = Arc::new(Scripted::default());
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let c = controller(r.clone())
            .with_dependency(flag.clone())
            .with_workers(2);
        let handle = c.clone();
        c.queue().add(Request::Sync("a".into()));

        let token = CancellationToken::new();
        let task = tokio::spawn(c.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.phase(), ControllerPhase::WaitingForSync);
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);

        flag.0.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.phase(), ControllerPhase::Running);
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);

        token.cancel();
        task.await.unwrap();
        assert_eq!(handle.phase(), ControllerPhase::ShuttingDown);
        assert!(handle.queue().is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_never_runs_concurrently() {
        let r = Arc::new(Scripted::default());
        let c = controller(r.clone()).with_workers(4);
        let handle = c.clone();
        let token = CancellationToken::new();
        let task = tokio::spawn(c.run(token.clone()));

        for _ in 0..20 {
            handle.queue().add(Request::Sync("same".into()));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        task.await.unwrap();

        assert_eq!(r.max_running.load(Ordering::SeqCst), 1);
        assert!(r.calls.load(Ordering::SeqCst) >= 2);
    }
}
