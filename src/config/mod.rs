//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → LifecycleConfig (validated, immutable)
//!     → CLI flags override individual fields (main.rs)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, read_config, ConfigError};
pub use schema::{HttpConfig, LifecycleConfig, ListenerConfig, LogFormat, ObservabilityConfig, ShutdownConfig, WorkerPolicy};
pub use validation::{validate_config, ValidationError};
