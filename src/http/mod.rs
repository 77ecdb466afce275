//! HTTP/1.1 protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted TCP connection
//!     → server.rs (accept loop, registry entry, spawn per connection)
//!     → protocol.rs (reader half)
//!         → codec.rs (AWAIT_HEAD → PARSING_BODY, 400/413 on bad input)
//!         → router lookup → handler.rs task per request (DISPATCHED)
//!     → bounded pipeline FIFO (arrival order)
//!     → protocol.rs (writer half)
//!         → errors.rs (HandlerError → Response via the error-handler chain)
//!         → response.rs (encode, keep-alive / close) (WRITING)
//!     → Send to client
//! ```

pub mod codec;
pub mod errors;
pub mod handler;
pub mod protocol;
pub mod request;
pub mod response;
pub mod server;

pub use codec::{ProtocolError, RequestDecoder};
pub use errors::{ErrorHandlers, ErrorMatcher};
pub use handler::{sync_handler, BoxError, Handler, HandlerError, HandlerFuture, SyncHandler};
pub use protocol::Connection;
pub use request::{Request, RequestHead};
pub use response::Response;
pub use server::{HttpServer, ServerError};
