//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGINT/SIGTERM for the duration of a run (on Windows: Ctrl-C,
//!   plus console close and system shutdown as the SIGTERM equivalents)
//! - Race signal delivery against lifecycle context cancellation
//! - Report which trigger started shutdown
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Registration happens before the server is built: Tokio buffers a
//!   delivery from the moment of registration, so an early signal is not lost
//! - The registration is owned by a single [`OsSignals`] value and dropped
//!   once shutdown has been triggered

use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

use crate::lifecycle::context::LifecycleContext;

/// A shutdown-requesting signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT, or Ctrl-C on Windows.
    Interrupt,
    /// SIGTERM, or console close / system shutdown on Windows.
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => write!(f, "SIGINT"),
            Signal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Something that delivers shutdown signals.
pub trait SignalSource: Send + 'static {
    /// Wait for the next signal. `None` means the source is exhausted and
    /// will never deliver again.
    fn recv(&mut self) -> impl Future<Output = Option<Signal>> + Send;
}

/// Process signal registration for one orchestrator run.
#[derive(Debug)]
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(windows)]
    ctrl_c: tokio::signal::windows::CtrlC,
    #[cfg(windows)]
    ctrl_close: tokio::signal::windows::CtrlClose,
    #[cfg(windows)]
    ctrl_shutdown: tokio::signal::windows::CtrlShutdown,
}

impl OsSignals {
    /// Register the shutdown signal handlers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(windows)]
        {
            use tokio::signal::windows::{ctrl_c, ctrl_close, ctrl_shutdown};
            Ok(Self {
                ctrl_c: ctrl_c()?,
                ctrl_close: ctrl_close()?,
                ctrl_shutdown: ctrl_shutdown()?,
            })
        }
    }
}

impl SignalSource for OsSignals {
    async fn recv(&mut self) -> Option<Signal> {
        #[cfg(unix)]
        {
            tokio::select! {
                received = self.interrupt.recv() => received.map(|()| Signal::Interrupt),
                received = self.terminate.recv() => received.map(|()| Signal::Terminate),
            }
        }

        #[cfg(windows)]
        {
            tokio::select! {
                received = self.ctrl_c.recv() => received.map(|()| Signal::Interrupt),
                received = self.ctrl_close.recv() => received.map(|()| Signal::Terminate),
                received = self.ctrl_shutdown.recv() => received.map(|()| Signal::Terminate),
            }
        }
    }
}

/// Lets callers request shutdown programmatically by sending a [`Signal`].
impl SignalSource for mpsc::UnboundedReceiver<Signal> {
    async fn recv(&mut self) -> Option<Signal> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

/// An absent source never delivers; only cancellation can trigger shutdown.
impl<S: SignalSource> SignalSource for Option<S> {
    async fn recv(&mut self) -> Option<Signal> {
        match self {
            Some(source) => source.recv().await,
            None => None,
        }
    }
}

/// What moved the run from `Running` to `ShuttingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A shutdown signal was delivered.
    Signal(Signal),
    /// The lifecycle context was cancelled, e.g. by a failing worker.
    Cancelled,
}

/// Block until either a signal arrives or `ctx` is cancelled.
///
/// An exhausted signal source leaves only the cancellation branch armed.
pub(crate) async fn wait_for_trigger<S: SignalSource>(ctx: &LifecycleContext, signals: &mut S) -> Trigger {
    let trigger = tokio::select! {
        biased;
        Some(signal) = signals.recv() => Trigger::Signal(signal),
        _ = ctx.cancelled() => Trigger::Cancelled,
    };

    match trigger {
        Trigger::Signal(signal) => {
            tracing::info!(signal = %signal, "Received OS signal, initiating shutdown");
        }
        Trigger::Cancelled => {
            tracing::info!("Lifecycle context cancelled, initiating shutdown");
        }
    }
    trigger
}
