//! Server orchestration: build, start, wait for a trigger, shut down, drain.
//!
//! # Phases
//! ```text
//! Starting → Running:       server constructed, init() and start() called
//! Running → ShuttingDown:   first of (signal, context cancelled); fires once
//! ShuttingDown → Drained:   shutdown(deadline) returned and tracker drained
//! ```
//!
//! # Ordering
//! - Context cancellation happens before `Server::shutdown` is invoked
//! - `Server::shutdown` returns before the tracker is waited on
//! - The run returns only after the tracker has drained, on every path

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::lifecycle::context::{Deadline, LifecycleContext};
use crate::lifecycle::error_group::ErrorGroup;
use crate::lifecycle::server::{Server, ShutdownError};
use crate::lifecycle::signals::{wait_for_trigger, OsSignals, Signal, SignalSource, Trigger};
use crate::lifecycle::task_counter::TaskCounter;
use crate::lifecycle::tracker::{WorkerError, WorkerTracker};

/// Why an aggregating run did not complete cleanly.
#[derive(Debug, Error)]
pub enum RunError {
    /// Shutdown was triggered by an OS signal. Not a failure as such, but
    /// lets callers tell a signalled exit apart from a clean one.
    #[error("terminated by {0}")]
    Signalled(Signal),

    /// The first failure reported by a worker task.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Signal handlers could not be installed; no server was built.
    #[error("failed to register signal handlers: {0}")]
    SignalRegistration(#[source] std::io::Error),
}

impl RunError {
    /// Returns `true` for the signal sentinel.
    pub fn is_signal(&self) -> bool {
        matches!(self, RunError::Signalled(_))
    }
}

/// Lifecycle phase of an orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Server is being constructed and initialized.
    Starting,
    /// Server started, watcher armed.
    Running,
    /// Shutdown triggered, `Server::shutdown` in progress.
    ShuttingDown,
    /// Shutdown returned and every tracked task finished.
    Drained,
}

/// Callback invoked with every shutdown failure.
pub type ShutdownHook = Arc<dyn Fn(&ShutdownError) + Send + Sync>;

/// Runs one server through its full lifecycle.
///
/// The tracker policy is fixed by the constructor used:
/// [`aggregating`](Orchestrator::aggregating) surfaces worker failures,
/// [`ignoring_failures`](Orchestrator::ignoring_failures) does not.
pub struct Orchestrator<T: WorkerTracker> {
    graceful_timeout: Duration,
    make_tracker: fn(&LifecycleContext) -> T,
    shutdown_hook: Option<ShutdownHook>,
    phase: Arc<watch::Sender<Phase>>,
}

impl<T: WorkerTracker> fmt::Debug for Orchestrator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("graceful_timeout", &self.graceful_timeout)
            .field("shutdown_hook", &self.shutdown_hook.is_some())
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

impl Orchestrator<ErrorGroup> {
    /// Worker failures cancel the run and are returned from it.
    pub fn aggregating(graceful_timeout: Duration) -> Self {
        Self::with_tracker(graceful_timeout, |ctx| ErrorGroup::new(ctx.clone()))
    }

    /// Run with the process' SIGINT/SIGTERM handlers.
    ///
    /// # Errors
    ///
    /// [`RunError::SignalRegistration`] if handlers cannot be installed,
    /// [`RunError::Signalled`] if a signal started the shutdown, or
    /// [`RunError::Worker`] with the first worker failure.
    pub async fn run<S, C>(self, constructor: C) -> Result<(), RunError>
    where
        S: Server,
        C: FnOnce(LifecycleContext, ErrorGroup) -> S,
    {
        let signals = OsSignals::register().map_err(RunError::SignalRegistration)?;
        self.run_with_signals(signals, constructor).await
    }

    /// Like [`run`](Self::run), with a caller-provided signal source.
    ///
    /// # Errors
    ///
    /// [`RunError::Signalled`] or [`RunError::Worker`], as for `run`.
    pub async fn run_with_signals<G, S, C>(self, signals: G, constructor: C) -> Result<(), RunError>
    where
        G: SignalSource,
        S: Server,
        C: FnOnce(LifecycleContext, ErrorGroup) -> S,
    {
        let (trigger, outcome) = self.drive(signals, constructor).await;
        match trigger {
            // A signalled run reports the signal even if a worker failed.
            Trigger::Signal(signal) => Err(RunError::Signalled(signal)),
            Trigger::Cancelled => outcome.map_err(RunError::Worker),
        }
    }
}

impl Orchestrator<TaskCounter> {
    /// Worker failures are logged and never influence the run.
    pub fn ignoring_failures(graceful_timeout: Duration) -> Self {
        Self::with_tracker(graceful_timeout, |_| TaskCounter::new())
    }

    /// Run with the process' SIGINT/SIGTERM handlers.
    ///
    /// If the handlers cannot be installed the failure is logged and only
    /// context cancellation can end the run.
    pub async fn run<S, C>(self, constructor: C)
    where
        S: Server,
        C: FnOnce(LifecycleContext, TaskCounter) -> S,
    {
        let signals = match OsSignals::register() {
            Ok(signals) => Some(signals),
            Err(error) => {
                tracing::error!(error = %error, "Failed to register signal handlers");
                None
            }
        };
        self.run_with_signals(signals, constructor).await;
    }

    /// Like [`run`](Self::run), with a caller-provided signal source.
    pub async fn run_with_signals<G, S, C>(self, signals: G, constructor: C)
    where
        G: SignalSource,
        S: Server,
        C: FnOnce(LifecycleContext, TaskCounter) -> S,
    {
        self.drive(signals, constructor).await;
    }
}

impl<T: WorkerTracker> Orchestrator<T> {
    fn with_tracker(graceful_timeout: Duration, make_tracker: fn(&LifecycleContext) -> T) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        Self {
            graceful_timeout,
            make_tracker,
            shutdown_hook: None,
            phase: Arc::new(phase),
        }
    }

    /// Register a callback for shutdown failures, in addition to the error log.
    pub fn on_shutdown_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ShutdownError) + Send + Sync + 'static,
    {
        self.shutdown_hook = Some(Arc::new(hook));
        self
    }

    /// Observe phase transitions of the upcoming run.
    pub fn phases(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    async fn drive<G, S, C>(self, mut signals: G, constructor: C) -> (Trigger, T::Outcome)
    where
        G: SignalSource,
        S: Server,
        C: FnOnce(LifecycleContext, T) -> S,
    {
        let ctx = LifecycleContext::new();
        let tracker = (self.make_tracker)(&ctx);

        let mut server = constructor(ctx.clone(), tracker.clone());
        server.init();
        server.start();
        self.phase.send_replace(Phase::Running);
        tracing::info!(graceful_timeout = ?self.graceful_timeout, "Server started");

        let (done_tx, done_rx) = oneshot::channel();
        let graceful_timeout = self.graceful_timeout;
        let hook = self.shutdown_hook.clone();
        let phase = Arc::clone(&self.phase);
        let watcher_ctx = ctx.clone();
        tokio::spawn(async move {
            let trigger = wait_for_trigger(&watcher_ctx, &mut signals).await;
            drop(signals);

            watcher_ctx.cancel();
            phase.send_replace(Phase::ShuttingDown);

            // The window starts now, not at process start.
            let deadline = Deadline::after(graceful_timeout);
            if let Err(error) = server.shutdown(deadline).await {
                tracing::error!(error = %error, "Server shutdown with error");
                if let Some(hook) = hook {
                    hook(&error);
                }
            }
            let _ = done_tx.send(trigger);
        });

        let trigger = match done_rx.await {
            Ok(trigger) => trigger,
            Err(_) => {
                // The shutdown task panicked; still drain before returning.
                tracing::error!("Shutdown task ended without completing");
                ctx.cancel();
                Trigger::Cancelled
            }
        };

        tracing::debug!(active = tracker.active(), "Waiting for workers to drain");
        let outcome = tracker.wait().await;
        self.phase.send_replace(Phase::Drained);
        tracing::info!("Shutdown complete");

        (trigger, outcome)
    }
}

/// Create, start and run a server until it has fully shut down, surfacing
/// the first worker failure.
///
/// # Errors
///
/// See [`Orchestrator::<ErrorGroup>::run`].
pub async fn run_server<S, C>(constructor: C, graceful_timeout: Duration) -> Result<(), RunError>
where
    S: Server,
    C: FnOnce(LifecycleContext, ErrorGroup) -> S,
{
    Orchestrator::aggregating(graceful_timeout).run(constructor).await
}

/// Create, start and run a server until it has fully shut down. Worker
/// failures are never surfaced.
pub async fn run_server_ignoring_failures<S, C>(constructor: C, graceful_timeout: Duration)
where
    S: Server,
    C: FnOnce(LifecycleContext, TaskCounter) -> S,
{
    Orchestrator::ignoring_failures(graceful_timeout).run(constructor).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Observations {
        shutdown_calls: AtomicUsize,
        cancelled_before_shutdown: AtomicBool,
        active_at_shutdown: AtomicUsize,
    }

    /// Runs one worker that waits for cancellation, optionally failing first.
    struct RecordingServer<T: WorkerTracker> {
        ctx: LifecycleContext,
        tracker: T,
        seen: Arc<Observations>,
        fail_worker: bool,
    }

    impl<T: WorkerTracker> Server for RecordingServer<T> {
        fn start(&mut self) {
            let ctx = self.ctx.clone();
            self.tracker.spawn(async move {
                ctx.cancelled().await;
                Ok(())
            });
            if self.fail_worker {
                self.tracker.spawn(async { Err("worker crashed".into()) });
            }
        }

        async fn shutdown(&mut self, _deadline: Deadline) -> Result<(), ShutdownError> {
            self.seen.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .cancelled_before_shutdown
                .store(self.ctx.is_cancelled(), Ordering::SeqCst);
            self.seen
                .active_at_shutdown
                .store(self.tracker.active(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn recording_server<T: WorkerTracker>(
        seen: &Arc<Observations>,
        fail_worker: bool,
    ) -> impl FnOnce(LifecycleContext, T) -> RecordingServer<T> {
        let seen = Arc::clone(seen);
        move |ctx, tracker| RecordingServer {
            ctx,
            tracker,
            seen,
            fail_worker,
        }
    }

    #[tokio::test]
    async fn repeated_signals_trigger_one_shutdown() {
        let seen = Arc::new(Observations::default());
        let (tx, rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            tx.send(Signal::Terminate).unwrap();
        }

        let result = Orchestrator::aggregating(Duration::from_secs(2))
            .run_with_signals(rx, recording_server::<ErrorGroup>(&seen, false))
            .await;

        assert!(matches!(result, Err(RunError::Signalled(Signal::Terminate))));
        assert!(result.unwrap_err().is_signal());
        assert_eq!(seen.shutdown_calls.load(Ordering::SeqCst), 1);
        assert!(seen.cancelled_before_shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn worker_failure_triggers_shutdown_and_is_returned() {
        let seen = Arc::new(Observations::default());
        let (_tx, rx) = mpsc::unbounded_channel::<Signal>();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            Orchestrator::aggregating(Duration::from_secs(1)).run_with_signals(rx, recording_server::<ErrorGroup>(&seen, true)),
        )
        .await
        .expect("failure should end the run");

        match result {
            Err(RunError::Worker(err)) => assert_eq!(err.to_string(), "worker failed: worker crashed"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(seen.shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signalled_run_reports_signal_over_worker_failure() {
        let seen = Arc::new(Observations::default());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Signal::Interrupt).unwrap();

        let result = Orchestrator::aggregating(Duration::from_secs(1))
            .run_with_signals(rx, recording_server::<ErrorGroup>(&seen, true))
            .await;

        assert!(matches!(result, Err(RunError::Signalled(Signal::Interrupt))));
    }

    #[tokio::test]
    async fn server_cancelling_its_context_is_a_clean_exit() {
        struct SelfStopping {
            ctx: LifecycleContext,
        }

        impl Server for SelfStopping {
            fn start(&mut self) {
                self.ctx.cancel();
            }

            async fn shutdown(&mut self, _deadline: Deadline) -> Result<(), ShutdownError> {
                Ok(())
            }
        }

        let (_tx, rx) = mpsc::unbounded_channel::<Signal>();
        let result = Orchestrator::aggregating(Duration::from_secs(1))
            .run_with_signals(rx, |ctx, _group| SelfStopping { ctx })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn ignoring_failures_keeps_running_until_signalled() {
        let seen = Arc::new(Observations::default());
        let (tx, rx) = mpsc::unbounded_channel();

        let orchestrator = Orchestrator::ignoring_failures(Duration::from_secs(1));
        let mut phases = orchestrator.phases();
        let run = tokio::spawn(orchestrator.run_with_signals(rx, recording_server::<TaskCounter>(&seen, true)));

        phases.wait_for(|p| *p == Phase::Running).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished(), "a failed worker must not end the run");
        assert_eq!(seen.shutdown_calls.load(Ordering::SeqCst), 0);

        tx.send(Signal::Terminate).unwrap();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("signal should end the run")
            .expect("run should not panic");
        assert_eq!(seen.shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*phases.borrow(), Phase::Drained);
    }

    #[tokio::test]
    async fn shutdown_runs_before_drain() {
        /// One worker that ignores cancellation and finishes on its own.
        struct Stubborn {
            tracker: TaskCounter,
            active_at_shutdown: Arc<AtomicUsize>,
        }

        impl Server for Stubborn {
            fn start(&mut self) {
                self.tracker.spawn(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                });
            }

            async fn shutdown(&mut self, _deadline: Deadline) -> Result<(), ShutdownError> {
                self.active_at_shutdown
                    .store(self.tracker.active(), Ordering::SeqCst);
                Ok(())
            }
        }

        let active_at_shutdown = Arc::new(AtomicUsize::new(usize::MAX));
        let seen = Arc::clone(&active_at_shutdown);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Signal::Terminate).unwrap();

        let started = tokio::time::Instant::now();
        Orchestrator::ignoring_failures(Duration::from_secs(1))
            .run_with_signals(rx, move |_, tracker| Stubborn {
                tracker,
                active_at_shutdown: seen,
            })
            .await;

        assert_eq!(active_at_shutdown.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn shutdown_errors_reach_the_hook() {
        struct Failing;

        impl Server for Failing {
            fn start(&mut self) {}

            async fn shutdown(&mut self, deadline: Deadline) -> Result<(), ShutdownError> {
                Err(ShutdownError::DeadlineExceeded {
                    timeout: deadline.timeout(),
                })
            }
        }

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Signal::Terminate).unwrap();

        let result = Orchestrator::aggregating(Duration::from_millis(250))
            .on_shutdown_error(move |err| sink.lock().unwrap().push(err.to_string()))
            .run_with_signals(rx, |_, _| Failing)
            .await;

        // A shutdown failure does not change the run outcome.
        assert!(matches!(result, Err(RunError::Signalled(_))));
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("250ms"));
    }

    #[tokio::test]
    async fn other_shutdown_failures_keep_their_source() {
        struct FlushFails;

        impl Server for FlushFails {
            fn start(&mut self) {}

            async fn shutdown(&mut self, _deadline: Deadline) -> Result<(), ShutdownError> {
                Err(ShutdownError::Other("journal flush refused".into()))
            }
        }

        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Signal::Interrupt).unwrap();

        Orchestrator::ignoring_failures(Duration::from_secs(1))
            .on_shutdown_error(move |err| {
                let source = std::error::Error::source(err).map(ToString::to_string);
                sink.lock().unwrap().push((err.to_string(), source));
            })
            .run_with_signals(rx, |_, _| FlushFails)
            .await;

        let reported = reported.lock().unwrap();
        assert_eq!(
            *reported,
            vec![(
                "shutdown failed: journal flush refused".to_string(),
                Some("journal flush refused".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn phases_advance_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::ignoring_failures(Duration::from_secs(1));
        let mut phases = orchestrator.phases();
        assert_eq!(*phases.borrow_and_update(), Phase::Starting);

        let seen = Arc::new(Observations::default());
        let run = tokio::spawn(orchestrator.run_with_signals(rx, recording_server::<TaskCounter>(&seen, false)));

        phases.wait_for(|p| *p == Phase::Running).await.unwrap();
        tx.send(Signal::Interrupt).unwrap();
        phases.wait_for(|p| *p == Phase::Drained).await.unwrap();
        run.await.unwrap();
    }
}
