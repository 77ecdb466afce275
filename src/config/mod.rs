//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)          CLI flags (binary only)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared via Arc with every worker subsystem
//!
//! With reload enabled:
//!     watcher.rs detects a change to the executable or a watched file
//!     → supervisor starts a fresh worker generation
//!     → new workers re-read the configuration on startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes take effect in a new worker generation
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    DrainConfig, ListenerConfig, ObservabilityConfig, ProtocolConfig, ReaperConfig, ReloadConfig,
    ServerConfig,
};
pub use validation::{validate_config, ValidationError};
