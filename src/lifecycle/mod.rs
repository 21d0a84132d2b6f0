//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (orchestrator.rs):
//!     Register signals → Build context + tracker → constructor → init() → start()
//!
//! Running:
//!     server work spawned into tracker (error_group.rs / task_counter.rs)
//!     signals.rs waits on SIGINT/SIGTERM or context cancellation
//!
//! Shutdown (orchestrator.rs):
//!     Trigger → Cancel context → shutdown(deadline) → Drain tracker → Return
//! ```
//!
//! # Design Decisions
//! - One cancellable context per run, never reused
//! - Shutdown has a deadline that starts when shutdown is triggered
//! - Draining the tracker is unconditional: the run never returns with
//!   tracked work still in flight

pub mod context;
pub mod error_group;
pub mod orchestrator;
pub mod server;
pub mod signals;
pub mod task_counter;
pub mod tracker;

pub use context::{Deadline, LifecycleContext};
pub use error_group::ErrorGroup;
pub use orchestrator::{run_server, run_server_ignoring_failures, Orchestrator, Phase, RunError, ShutdownHook};
pub use server::{Server, ShutdownError};
pub use signals::{OsSignals, Signal, SignalSource, Trigger};
pub use task_counter::TaskCounter;
pub use tracker::{BoxError, WorkerError, WorkerResult, WorkerTracker};
