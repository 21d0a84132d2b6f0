//! The contract every orchestrated server implements.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::context::Deadline;
use crate::lifecycle::tracker::BoxError;

/// Failure reported by [`Server::shutdown`].
///
/// Shutdown failures are reported but never abort the drain.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// In-flight work was still running when the deadline expired and
    /// remaining resources were force-closed.
    #[error("shutdown did not complete within {timeout:?}, remaining work was force-closed")]
    DeadlineExceeded { timeout: Duration },

    /// Any other failure while stopping, e.g. flushing state or closing a
    /// client.
    #[error("shutdown failed: {0}")]
    Other(#[source] BoxError),
}

/// A unit of long-running work managed by the orchestrator.
///
/// Constructors receive the lifecycle context and the worker tracker but
/// must not start anything; work starts in [`start`](Server::start).
pub trait Server: Send + 'static {
    /// One-time setup before `start`. Must be idempotent.
    fn init(&mut self) {}

    /// Spawn the server's work into its tracker and return immediately.
    fn start(&mut self);

    /// Stop accepting new work and wait for in-flight work, bounded by
    /// `deadline`.
    fn shutdown(&mut self, deadline: Deadline) -> impl Future<Output = Result<(), ShutdownError>> + Send;
}
