//! Handler contract.
//!
//! A handler receives a parsed [`Request`] and resolves to a [`Response`]
//! or a [`HandlerError`]. It may suspend freely; each invocation runs as its
//! own task so the engine can keep reading pipelined requests and can abort
//! the task outright during drain escalation.

use std::fmt;
use std::future::Future;

use futures_util::future::{self, BoxFuture};

use crate::http::{Request, Response};

/// Boxed application error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Response, HandlerError>>;

/// A request handler registered on a route.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        Box::pin(self(request))
    }
}

/// Handler that never suspends.
#[derive(Clone)]
pub struct SyncHandler<F>(F);

/// Wrap a synchronous function as a [`Handler`].
pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    SyncHandler(f)
}

impl<F> Handler for SyncHandler<F>
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn call(&self, request: Request) -> HandlerFuture {
        Box::pin(future::ready((self.0)(request)))
    }
}

/// Why a request did not produce a response on its own.
///
/// Engine-raised conditions are explicit variants; anything an application
/// raises travels as [`HandlerError::Failure`] and can be matched by type.
pub enum HandlerError {
    /// No route matched the request.
    NotFound,
    /// The handler's task was cancelled before it completed.
    Cancelled,
    /// The handler panicked; carries the panic message when available.
    Panicked(String),
    /// Any other application error.
    Failure(BoxError),
}

impl HandlerError {
    /// Application failure carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failure(message.into().into())
    }

    /// The application error, when this is a failure of type `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            HandlerError::Failure(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::NotFound => "route_not_found",
            HandlerError::Cancelled => "cancelled",
            HandlerError::Panicked(_) => "panic",
            HandlerError::Failure(_) => "failure",
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        HandlerError::Failure(Box::new(err))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::NotFound => write!(f, "route not found"),
            HandlerError::Cancelled => write!(f, "handler cancelled"),
            HandlerError::Panicked(msg) => write!(f, "handler panicked: {}", msg),
            HandlerError::Failure(err) => {
                write!(f, "{}", err)?;
                let mut source = err.source();
                while let Some(cause) = source {
                    write!(f, ": {}", cause)?;
                    source = cause.source();
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::NotFound => f.write_str("NotFound"),
            HandlerError::Cancelled => f.write_str("Cancelled"),
            HandlerError::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
            HandlerError::Failure(err) => f.debug_tuple("Failure").field(err).finish(),
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
