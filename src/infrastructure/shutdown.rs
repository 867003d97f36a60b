//! Shutdown Controller
//!
//! Owns the client's background tasks, signals them to stop, and tracks
//! in-flight calls so `stop` can drain them.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Shutdown coordinator for graceful termination.
///
/// Cloning shares the same state.
#[derive(Clone)]
pub struct ShutdownController {
    /// Whether shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Number of calls in flight
    active_calls: Arc<AtomicUsize>,
    /// Broadcast channel for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Notify when all calls are drained
    drain_complete: Arc<Notify>,
    /// Background tasks owned by this controller
    tasks: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl ShutdownController {
    /// Create a new shutdown controller.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_calls: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drain_complete: Arc::new(Notify::new()),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a background task owned by this controller.
    ///
    /// The task should watch a [`subscribe`](Self::subscribe) receiver and
    /// return once shutdown is signalled.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!("spawning background task {}", name);
        let handle = tokio::spawn(task);
        self.tasks.lock().push((name, handle));
    }

    /// Number of background tasks not yet joined.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Initiate graceful shutdown.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("initiating graceful shutdown");
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Check if shutdown has been initiated.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for every background task.
    ///
    /// Tasks still running after `timeout` are aborted.
    pub async fn shutdown_and_join(&self, timeout: Duration) {
        self.shutdown();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());

        for (name, mut handle) in tasks {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => tracing::debug!("background task {} stopped", name),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::warn!("background task {} panicked: {}", name, e),
                Err(_) => {
                    tracing::warn!("background task {} did not stop in {:?}, aborting", name, timeout);
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
    }

    /// Get the number of calls in flight.
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    fn call_started(&self) {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn call_ended(&self) {
        let prev = self.active_calls.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all in-flight calls to finish (with timeout).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let notified = self.drain_complete.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.active_calls() == 0 {
            return true;
        }

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "drain timeout: {} calls still active",
                    self.active_calls()
                );
                false
            }
        }
    }

    /// Create a guard that counts a call as in flight until dropped.
    pub fn call_guard(&self) -> CallGuard {
        self.call_started();
        CallGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for tracking in-flight calls.
///
/// Automatically decrements the call count when dropped.
pub struct CallGuard {
    controller: ShutdownController,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.controller.call_ended();
    }
}
