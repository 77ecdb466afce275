//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, per-worker span)
//!     → metrics.rs (counters, gauges, histograms through the `metrics` facade)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Whatever recorder the embedding application installs
//! ```
//!
//! # Design Decisions
//! - Structured fields, never formatted strings, for machine parsing
//! - No recorder is installed here; without one every metric call is a no-op
//! - Per-request logging is debug-level only

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
