//! Worker tracking abstraction.
//!
//! # Responsibilities
//! - Register background work spawned by a server
//! - Wait until every registered task has finished
//!
//! # Policies
//! - [`ErrorGroup`](super::ErrorGroup): first failure cancels the lifecycle
//!   context and is returned from `wait()`
//! - [`TaskCounter`](super::TaskCounter): failures are logged and dropped,
//!   `wait()` only reports that the work drained
//!
//! The two policies are separate types on purpose: their failure contracts
//! differ observably and callers pick one explicitly.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Error currency for background tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a spawned worker task.
pub type WorkerResult = Result<(), BoxError>;

/// A failure captured from a worker task.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// The task returned an error.
    #[error("worker failed: {0}")]
    Failed(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The task panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        WorkerError::Panicked(message)
    }
}

impl From<BoxError> for WorkerError {
    fn from(error: BoxError) -> Self {
        WorkerError::Failed(Arc::from(error))
    }
}

/// A set of concurrently running tasks that can be waited on.
///
/// Implementations are cheap handles over shared state: clones register
/// into and wait on the same set.
pub trait WorkerTracker: Clone + Send + Sync + 'static {
    /// What `wait()` reports once the set has drained.
    type Outcome: Send;

    /// Register `task` and run it in the background.
    ///
    /// Never blocks. Must be called from within a Tokio runtime.
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = WorkerResult> + Send + 'static;

    /// Resolves once every registered task has completed.
    fn wait(&self) -> impl Future<Output = Self::Outcome> + Send;

    /// Number of registered tasks that have not finished yet.
    fn active(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let err = WorkerError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "worker panicked: boom");

        let err = WorkerError::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err.to_string(), "worker panicked: owned boom");

        let err = WorkerError::from_panic(Box::new(42u32));
        assert_eq!(err.to_string(), "worker panicked: non-string panic payload");
    }

    #[test]
    fn boxed_errors_keep_their_source() {
        let boxed: BoxError = "listener exploded".into();
        let err = WorkerError::from(boxed);
        assert_eq!(err.to_string(), "worker failed: listener exploded");
        assert!(std::error::Error::source(&err).is_some());
    }
}
