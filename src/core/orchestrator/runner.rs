//! Supervised background execution for the controller.
//!
//! Every long step runs inside a task spawned here. Tasks share a parent
//! [`CancellationToken`], so a shutdown aborts all of them at their next
//! suspension point, and a [`TaskTracker`] lets callers wait until the
//! runner has gone idle.

use anyhow::{Context, Result};
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::types::LoopError;

pub struct TaskRunner {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Handle to a spawned task: awaitable result plus its own cancellation handle.
pub struct BackgroundTask<T> {
    name: &'static str,
    handle: JoinHandle<Result<T>>,
    cancel: CancellationToken,
}

impl<T> BackgroundTask<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<T> {
        self.handle
            .await
            .with_context(|| format!("background task '{}' panicked", self.name))?
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn `make(token)` on the runtime. The token is a child of the
    /// runner's token and must be honored by the task's suspension points.
    pub fn spawn<F, Fut, T>(&self, name: &'static str, make: F) -> BackgroundTask<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.cancel.child_token();
        let fut = make(token.clone());
        let handle = self.tracker.spawn(async move {
            let result = fut.await;
            if let Err(e) = &result {
                if matches!(e.downcast_ref::<LoopError>(), Some(LoopError::Cancelled)) {
                    info!("Background task '{}' cancelled", name);
                } else {
                    error!("Background task '{}' failed: {:#}", name, e);
                }
            }
            result
        });
        BackgroundTask {
            name,
            handle,
            cancel: token,
        }
    }

    /// Wait for every task spawned so far, including tasks they spawn before finishing.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.wait_idle().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Run CPU-heavy work on the blocking pool, giving up as soon as `cancel` fires.
/// An abandoned closure keeps running to completion but its result is dropped.
pub async fn run_blocking<T, F>(cancel: &CancellationToken, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(LoopError::Cancelled.into());
    }
    let handle = tokio::task::spawn_blocking(work);
    tokio::select! {
        _ = cancel.cancelled() => Err(LoopError::Cancelled.into()),
        joined = handle => joined.context("blocking work panicked")?,
    }
}
