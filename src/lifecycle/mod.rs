//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Init logging → Role from env
//!     ├─ supervisor: validate → bind once → spawn N workers (supervisor.rs)
//!     └─ worker: adopt fd → event loop → HttpServer (worker.rs)
//!
//! Steady state (per worker):
//!     reaper.rs ticks → close idle connections with empty pipelines
//!
//! Shutdown (signals.rs → shutdown.rs):
//!     supervisor SIGTERM/SIGINT → SIGTERM every worker → wait → SIGKILL late ones
//!     worker signal → stop accepting → drain.rs → close listener → cleanup hooks
//!
//! Reload (signals.rs SIGHUP or config/watcher.rs):
//!     spawn generation N+1 on the same socket → SIGTERM generation N
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Drain is bounded: forced cancellation after the escalation window
//! - The listening socket never closes during reload

pub mod drain;
pub mod reaper;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod supervisor;
pub mod worker;

pub use drain::{Drain, DrainReport};
pub use reaper::Reaper;
pub use shutdown::Shutdown;
pub use signals::{SupervisorSignal, SupervisorSignals, WorkerSignals};
pub use startup::{run, StartupError};
pub use supervisor::{signal_name, ExitKind, Supervisor, SupervisorError};
pub use worker::{WorkerEnv, WorkerError};
