//! forkserve demo server.
//!
//! ```text
//!     forkserve --workers 4 --bind 0.0.0.0:8080 --reload
//! ```
//!
//! Routes:
//! - `GET /` hello world
//! - `GET /love`, `GET /{p}` literal-over-parameter precedence
//! - `POST|DELETE /methods` method sets
//! - `GET /params/{p1}/{p2}` path parameters
//! - `GET /sleep/{secs}` a handler that suspends
//! - `GET /kitty` an application error with its own error handler
//! - `GET /unhandled` an application error falling through to 500

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use http::{Method, StatusCode};

use forkserve::config::{load_config, ServerConfig};
use forkserve::{App, ErrorMatcher, HandlerError, Request, Response};

#[derive(Debug, Parser)]
#[command(name = "forkserve", version, about = "Multi-process HTTP/1.1 demo server")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind, e.g. 0.0.0.0:8080.
    #[arg(short, long)]
    bind: Option<String>,

    /// Number of worker processes.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Reload workers on SIGHUP or when the binary changes.
    #[arg(long)]
    reload: bool,

    /// Put error detail in 500 responses.
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, forkserve::config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(workers) = self.workers {
            config.listener.workers = workers;
        }
        config.reload.enabled |= self.reload;
        config.debug |= self.debug;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("meow")]
struct KittyError;

#[derive(Debug, thiserror::Error)]
#[error("nobody handles this")]
struct UnhandledError;

async fn hello(_: Request) -> Result<Response, HandlerError> {
    Ok(Response::text("Hello world!"))
}

async fn love(_: Request) -> Result<Response, HandlerError> {
    Ok(Response::text("I love you"))
}

async fn echo_segment(request: Request) -> Result<Response, HandlerError> {
    Ok(Response::text(format!("You said {}", request.param("p").unwrap_or_default())))
}

async fn methods(request: Request) -> Result<Response, HandlerError> {
    Ok(Response::text(request.method().as_str().to_string()))
}

async fn params(request: Request) -> Result<Response, HandlerError> {
    let body = request
        .params()
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Response::text(body))
}

async fn sleep(request: Request) -> Result<Response, HandlerError> {
    let secs: u64 = request.param("secs").unwrap_or("0").parse()?;
    tokio::time::sleep(Duration::from_secs(secs)).await;
    Ok(Response::text(format!("Slept {} seconds", secs)))
}

async fn kitty(_: Request) -> Result<Response, HandlerError> {
    Err(KittyError)?
}

async fn unhandled(_: Request) -> Result<Response, HandlerError> {
    Err(UnhandledError)?
}

fn app(debug: bool) -> Result<App, forkserve::RouteError> {
    App::builder()
        .get("/", hello)
        .get("/love", love)
        .get("/{p}", echo_segment)
        .route([Method::POST, Method::DELETE], "/methods", methods)
        .get("/params/{p1}/{p2}", params)
        .get("/sleep/{secs}", sleep)
        .get("/kitty", kitty)
        .get("/unhandled", unhandled)
        .error_handler(ErrorMatcher::of::<KittyError>(), |_, err| {
            Ok(Response::text(format!("Just a kitty, {}", err)))
        })
        .error_handler(ErrorMatcher::RouteNotFound, |head, _| {
            Ok(Response::text_with_status(
                StatusCode::NOT_FOUND,
                format!("Are you lost, pal? Nothing at {}", head.path()),
            ))
        })
        .debug(debug)
        .build()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    let app = app(config.debug)?;
    forkserve::run(app, config)?;
    Ok(())
}
