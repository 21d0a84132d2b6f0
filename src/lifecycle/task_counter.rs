//! Non-aggregating worker tracker.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::lifecycle::tracker::{WorkerResult, WorkerTracker};

/// Tracker that only counts in-flight tasks.
///
/// Task failures are logged and otherwise dropped: they never reach
/// `wait()` and never cancel sibling tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskCounter {
    inner: Arc<CounterState>,
}

#[derive(Debug, Default)]
struct CounterState {
    active: AtomicUsize,
    drained: Notify,
}

impl TaskCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self) -> TaskGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            state: Arc::clone(&self.inner),
        }
    }
}

impl WorkerTracker for TaskCounter {
    type Outcome = ();

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = WorkerResult> + Send + 'static,
    {
        // Registered before the task exists so wait() can never miss it.
        let guard = self.track();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = task.await {
                tracing::warn!(error = %error, "Worker failed, ignoring");
            }
        });
    }

    fn wait(&self) -> impl Future<Output = ()> + Send {
        let state = Arc::clone(&self.inner);
        async move {
            loop {
                let notified = state.drained.notified();
                tokio::pin!(notified);
                // Register interest before reading the count, otherwise the
                // last guard could drop in between and the wakeup is lost.
                notified.as_mut().enable();
                if state.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        }
    }

    fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

/// Releases one registration when dropped, including on panic.
#[derive(Debug)]
struct TaskGuard {
    state: Arc<CounterState>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let prev = self.state.active.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.state.drained.notify_waiters();
        }
    }
}
