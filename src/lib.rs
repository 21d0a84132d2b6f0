//! Lifecycle orchestration for long-running servers.
//!
//! A [`Server`] is built by a caller-supplied constructor, started, and then
//! shut down when the process receives SIGINT/SIGTERM or when its lifecycle
//! context is cancelled. The run returns only after the server's shutdown
//! has returned and every tracked worker task has finished.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use config::LifecycleConfig;
pub use http::HttpServer;
pub use lifecycle::{
    run_server, run_server_ignoring_failures, Deadline, ErrorGroup, LifecycleContext, Orchestrator, RunError, Server,
    ShutdownError, TaskCounter, WorkerTracker,
};
