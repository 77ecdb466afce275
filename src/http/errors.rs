//! Error-handler chain.
//!
//! # Responsibilities
//! - Hold the ordered (matcher, handler) pairs registered at setup
//! - Turn a [`HandlerError`] into exactly one [`Response`]
//! - Contain failures raised by error handlers themselves
//!
//! # Design Decisions
//! - First matching entry wins; registration order is evaluation order
//! - Unmatched errors fall through to the default policy:
//!   not found → 404, cancelled → 503, anything else → 500
//! - A failing or panicking error handler yields a generic 500 and is logged;
//!   it never reaches the connection

use std::any::type_name;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use http::StatusCode;

use crate::http::handler::{panic_message, BoxError, HandlerError};
use crate::http::{RequestHead, Response};

/// Function invoked for a matching error.
pub type ErrorHandlerFn =
    dyn Fn(&RequestHead, &HandlerError) -> Result<Response, BoxError> + Send + Sync + 'static;

type Predicate = dyn Fn(&HandlerError) -> bool + Send + Sync + 'static;

type ErrorProbe = fn(&(dyn std::error::Error + Send + Sync + 'static)) -> bool;

fn is_error_of<E: std::error::Error + 'static>(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    err.is::<E>()
}

/// Selects which errors an error handler applies to.
#[derive(Clone)]
pub enum ErrorMatcher {
    /// No route matched.
    RouteNotFound,
    /// The handler task was cancelled.
    Cancelled,
    /// An application failure whose error is of a given type.
    Type { name: &'static str, probe: ErrorProbe },
    /// A custom predicate.
    Predicate(Arc<Predicate>),
    /// Every error, including panics.
    Any,
}

impl ErrorMatcher {
    /// Match failures whose boxed error is an `E`.
    pub fn of<E: std::error::Error + 'static>() -> Self {
        ErrorMatcher::Type {
            name: type_name::<E>(),
            probe: is_error_of::<E>,
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        ErrorMatcher::Predicate(Arc::new(f))
    }

    pub fn matches(&self, error: &HandlerError) -> bool {
        match (self, error) {
            (ErrorMatcher::Any, _) => true,
            (ErrorMatcher::RouteNotFound, HandlerError::NotFound) => true,
            (ErrorMatcher::Cancelled, HandlerError::Cancelled) => true,
            (ErrorMatcher::Type { probe, .. }, HandlerError::Failure(err)) => probe(err.as_ref()),
            (ErrorMatcher::Predicate(f), error) => f(error),
            _ => false,
        }
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::RouteNotFound => f.write_str("RouteNotFound"),
            ErrorMatcher::Cancelled => f.write_str("Cancelled"),
            ErrorMatcher::Type { name, .. } => write!(f, "Type({})", name),
            ErrorMatcher::Predicate(_) => f.write_str("Predicate(..)"),
            ErrorMatcher::Any => f.write_str("Any"),
        }
    }
}

struct ErrorEntry {
    matcher: ErrorMatcher,
    handler: Box<ErrorHandlerFn>,
}

/// Ordered error-handler chain with the default policy as its tail.
#[derive(Default)]
pub struct ErrorHandlers {
    entries: Vec<ErrorEntry>,
    debug: bool,
}

impl ErrorHandlers {
    pub fn new(debug: bool) -> Self {
        Self {
            entries: Vec::new(),
            debug,
        }
    }

    pub fn push<F>(&mut self, matcher: ErrorMatcher, handler: F)
    where
        F: Fn(&RequestHead, &HandlerError) -> Result<Response, BoxError> + Send + Sync + 'static,
    {
        self.entries.push(ErrorEntry {
            matcher,
            handler: Box::new(handler),
        });
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Produce the response for a failed request.
    pub fn resolve(&self, head: &RequestHead, error: &HandlerError) -> Response {
        for entry in &self.entries {
            if !entry.matcher.matches(error) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| (entry.handler)(head, error))) {
                Ok(Ok(response)) => return response,
                Ok(Err(failure)) => {
                    tracing::error!(
                        matcher = ?entry.matcher,
                        error = %failure,
                        "Exception in error handler"
                    );
                }
                Err(payload) => {
                    tracing::error!(
                        matcher = ?entry.matcher,
                        panic = %panic_message(payload.as_ref()),
                        "Error handler panicked"
                    );
                }
            }

            tracing::error!(
                method = %head.method(),
                path = %head.path(),
                error = %error,
                "Error handler failed while handling request error"
            );
            crate::observability::metrics::record_error_handler_failure();
            return internal_server_error();
        }

        self.default_response(head, error)
    }

    fn default_response(&self, head: &RequestHead, error: &HandlerError) -> Response {
        match error {
            HandlerError::NotFound => Response::text_with_status(StatusCode::NOT_FOUND, "Not Found"),
            HandlerError::Cancelled => {
                Response::text_with_status(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
            }
            HandlerError::Panicked(_) | HandlerError::Failure(_) => {
                tracing::error!(
                    method = %head.method(),
                    path = %head.path(),
                    error = ?error,
                    "Unhandled handler error"
                );
                if self.debug {
                    Response::text_with_status(StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}\n{}", error, error))
                } else {
                    internal_server_error()
                }
            }
        }
    }
}

fn internal_server_error() -> Response {
    Response::text_with_status(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

impl fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlers")
            .field("matchers", &self.entries.iter().map(|e| &e.matcher).collect::<Vec<_>>())
            .field("debug", &self.debug)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::head_for_test;
    use http::Method;

    #[derive(Debug, thiserror::Error)]
    #[error("meow error")]
    struct KittyError;

    #[derive(Debug, thiserror::Error)]
    #[error("woof error")]
    struct DoggieError;

    fn body(response: &Response) -> &str {
        std::str::from_utf8(response.body()).unwrap()
    }

    fn head() -> RequestHead {
        head_for_test(Method::GET, "/cat")
    }

    #[test]
    fn defaults_follow_policy() {
        let chain = ErrorHandlers::new(false);

        let not_found = chain.resolve(&head(), &HandlerError::NotFound);
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&not_found), "Not Found");

        let cancelled = chain.resolve(&head(), &HandlerError::Cancelled);
        assert_eq!(cancelled.status(), StatusCode::SERVICE_UNAVAILABLE);

        let failed = chain.resolve(&head(), &HandlerError::from(KittyError));
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&failed), "Internal Server Error");
    }

    #[test]
    fn debug_mode_exposes_detail() {
        let chain = ErrorHandlers::new(true);
        let failed = chain.resolve(&head(), &HandlerError::from(KittyError));
        assert!(body(&failed).contains("meow error"));
    }

    #[test]
    fn first_structural_match_wins() {
        let mut chain = ErrorHandlers::new(false);
        chain.push(ErrorMatcher::of::<DoggieError>(), |_, _| Ok(Response::text("dog")));
        chain.push(ErrorMatcher::of::<KittyError>(), |_, err| {
            Ok(Response::text(format!("Just a kitty, {}", err)))
        });
        chain.push(ErrorMatcher::Any, |_, _| Ok(Response::text("any")));

        let response = chain.resolve(&head(), &HandlerError::from(KittyError));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(&response), "Just a kitty, meow error");

        let response = chain.resolve(&head(), &HandlerError::Cancelled);
        assert_eq!(body(&response), "any");
    }

    #[test]
    fn custom_not_found_is_used_verbatim() {
        let mut chain = ErrorHandlers::new(false);
        chain.push(ErrorMatcher::RouteNotFound, |_, _| {
            Ok(Response::text_with_status(StatusCode::NOT_FOUND, "Are you lost, pal?"))
        });

        let response = chain.resolve(&head(), &HandlerError::NotFound);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(&response), "Are you lost, pal?");
    }

    #[test]
    fn failing_error_handler_becomes_generic_500() {
        let mut chain = ErrorHandlers::new(true);
        chain.push(ErrorMatcher::RouteNotFound, |_, _| Err("handler exploded".into()));
        chain.push(ErrorMatcher::Any, |_, _| Ok(Response::text("unreachable")));

        let response = chain.resolve(&head(), &HandlerError::NotFound);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(&response), "Internal Server Error");
    }

    #[test]
    fn panicking_error_handler_is_contained() {
        let mut chain = ErrorHandlers::new(false);
        chain.push(ErrorMatcher::Any, |_, _| panic!("error handler bug"));

        let response = chain.resolve(&head(), &HandlerError::msg("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn predicates_see_the_error() {
        let matcher = ErrorMatcher::predicate(|err| matches!(err, HandlerError::Panicked(_)));
        assert!(matcher.matches(&HandlerError::Panicked("x".into())));
        assert!(!matcher.matches(&HandlerError::NotFound));
        assert!(!ErrorMatcher::of::<KittyError>().matches(&HandlerError::from(DoggieError)));
    }
}
