//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default time background tasks get to finish before they are aborted.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of [`ShutdownCoordinator::graceful_shutdown`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished on their own.
    pub completed: usize,
    /// Names of tasks aborted after the deadline.
    pub aborted: Vec<&'static str>,
}

/// Owns the root cancellation token and the background tasks hanging off it.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with a fresh root token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Clone of the root token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled with the root but cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Track a background task so shutdown waits for it. Handles of tasks
    /// that already finished are dropped.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((name, handle));
    }

    /// Number of tracked tasks still held.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel the root token.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything, wait up to `timeout` for tracked tasks, then
    /// abort whatever is still running.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        info!(
            task_count = tasks.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();
        for (name, mut handle) in tasks {
            match time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(e)) => {
                    warn!(task = name, error = %e, "task ended abnormally");
                    report.completed += 1;
                }
                Err(_) => {
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }

        if !report.aborted.is_empty() {
            warn!(aborted = ?report.aborted, "shutdown timed out after {timeout:?}, tasks aborted");
        }
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
