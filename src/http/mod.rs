//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Router (caller-supplied)
//!     → server.rs (tracing + timeout layers, hyper-util accept loop)
//!     → accept loop spawned into the worker tracker on start(),
//!       connections owned by a JoinSet inside it
//!     → shutdown(deadline): drain, then abort open connections on expiry
//! ```

pub mod server;

pub use server::HttpServer;
