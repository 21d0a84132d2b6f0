//! Error-aggregating worker tracker.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use tokio_util::task::TaskTracker;

use crate::lifecycle::context::LifecycleContext;
use crate::lifecycle::tracker::{WorkerError, WorkerResult, WorkerTracker};

/// Tracker that surfaces the first worker failure.
///
/// The first task to fail (error or panic) has its failure recorded and
/// cancels the shared [`LifecycleContext`], so cooperating peers can stop
/// early. Later failures are logged and discarded.
#[derive(Debug, Clone)]
pub struct ErrorGroup {
    ctx: LifecycleContext,
    tasks: TaskTracker,
    first_error: Arc<OnceLock<WorkerError>>,
}

impl ErrorGroup {
    /// Create a group bound to `ctx`.
    pub fn new(ctx: LifecycleContext) -> Self {
        Self {
            ctx,
            tasks: TaskTracker::new(),
            first_error: Arc::new(OnceLock::new()),
        }
    }

    /// The failure recorded so far, if any.
    pub fn first_error(&self) -> Option<&WorkerError> {
        self.first_error.get()
    }

    fn record(&self, error: WorkerError) {
        // Store before cancelling so anyone woken by the cancellation sees it.
        match self.first_error.set(error) {
            Ok(()) => {
                if let Some(error) = self.first_error.get() {
                    tracing::warn!(error = %error, "Worker failed, cancelling lifecycle context");
                }
            }
            Err(discarded) => {
                tracing::debug!(error = %discarded, "Discarding worker failure after the first");
            }
        }
        self.ctx.cancel();
    }
}

impl WorkerTracker for ErrorGroup {
    type Outcome = Result<(), WorkerError>;

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = WorkerResult> + Send + 'static,
    {
        let group = self.clone();
        self.tasks.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => group.record(WorkerError::from(error)),
                Err(payload) => group.record(WorkerError::from_panic(payload)),
            }
        });
    }

    fn wait(&self) -> impl Future<Output = Self::Outcome> + Send {
        let tasks = self.tasks.clone();
        let ctx = self.ctx.clone();
        let first_error = Arc::clone(&self.first_error);
        async move {
            tasks.close();
            tasks.wait().await;
            ctx.cancel();
            match first_error.get() {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }
    }

    fn active(&self) -> usize {
        self.tasks.len()
    }
}
