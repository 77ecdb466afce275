//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Route Compilation (at setup):
//!     (methods, "/users/{id}", handler)[]
//!     → pattern.rs (split into literal / parameter segments, validate)
//!     → router.rs (insert into segment trie, detect collisions)
//!     → Freeze as immutable Router
//!
//! Incoming Request (method, path):
//!     → router.rs (walk trie: literal child first, then parameter child)
//!     → Return: handler + PathParams, or None (route not found)
//! ```
//!
//! # Design Decisions
//! - Routes compiled once, immutable at runtime
//! - No regex in hot path
//! - Deterministic: the most specific route wins, never registration order

pub mod pattern;
pub mod router;

pub use pattern::{PathPattern, Segment};
pub use router::{MethodSet, PathParams, RouteError, RouteMatch, Router, RouterBuilder};
