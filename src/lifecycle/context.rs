//! Cancellable lifecycle scope and the shutdown deadline.
//!
//! # Responsibilities
//! - Carry the single "begin shutdown" signal to every interested task
//! - Bound the teardown phase with a deadline that starts when shutdown does

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned};

/// Cancellable execution scope shared by the orchestrator, the server and
/// every worker task.
///
/// Cloning is cheap; all clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct LifecycleContext {
    token: CancellationToken,
}

impl LifecycleContext {
    /// Create a new, not yet cancelled context.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Cancel the context. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns `true` once the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the context is cancelled (immediately if it already is).
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Owned variant of [`cancelled`](Self::cancelled), for moving into tasks.
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    /// Derive a token that is cancelled with this context but can also be
    /// cancelled on its own without affecting the parent.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// Deadline-bounded scope handed to [`Server::shutdown`](crate::lifecycle::Server::shutdown).
///
/// The clock starts when the deadline is created, which the orchestrator
/// does at the moment shutdown is triggered.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    /// The window this deadline was created with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Resolves when the deadline expires.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.at).await;
    }
}
