//! forkserve: a multi-process HTTP/1.1 server core.
//!
//! A supervisor binds one listening socket and spawns worker processes that
//! all accept on it. Each worker runs a single-threaded event loop with a
//! pipelining protocol engine, a segment-trie router, an idle-connection
//! reaper and a bounded graceful drain.
//!
//! ```no_run
//! use forkserve::{App, HandlerError, Request, Response, ServerConfig};
//!
//! async fn hello(_: Request) -> Result<Response, HandlerError> {
//!     Ok(Response::text("Hello world!"))
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::builder().get("/", hello).build()?;
//!     forkserve::run(app, ServerConfig::default())?;
//!     Ok(())
//! }
//! ```

// Core subsystems
pub mod app;
pub mod config;
pub mod http;
pub mod net;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use app::{App, AppBuilder};
pub use config::ServerConfig;
pub use http::{
    sync_handler, BoxError, ErrorMatcher, Handler, HandlerError, HttpServer, Request, RequestHead, Response,
};
pub use lifecycle::{run, DrainReport, Shutdown, StartupError};
pub use net::Listener;
pub use routing::{MethodSet, PathParams, RouteError};
