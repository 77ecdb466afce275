//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor:
//!     listener.rs bind_shared (SO_REUSEADDR, backlog)
//!     → set_inheritable (clear FD_CLOEXEC)
//!     → fd number handed to each worker at spawn
//!
//! Worker:
//!     listener.rs adopt(fd) → Listener (accept loop, connection limits)
//!     → connection.rs (registry entry, state tag, idle clock)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - One socket for all workers; the kernel balances accepts
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for reaping and graceful drain

pub mod connection;
pub mod listener;

pub use connection::{
    ConnCommand, ConnectionGuard, ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState,
};
pub use listener::{adopt, bind_shared, set_inheritable, ConnectionPermit, Listener, ListenerError};
