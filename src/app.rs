//! Application assembly.
//!
//! # Responsibilities
//! - Collect routes, error handlers and lifecycle hooks during setup
//! - Compile them into an immutable [`App`] shared by every connection
//!
//! # Design Decisions
//! - Registration is an explicit builder; nothing can be added after `build`
//! - Route collisions and malformed patterns fail `build`, never a request
//! - Startup hooks fail fast; cleanup hooks only log

use std::fmt;
use std::future::Future;

use futures_util::future::BoxFuture;
use http::Method;

use crate::http::{BoxError, ErrorHandlers, ErrorMatcher, Handler, HandlerError, RequestHead, Response};
use crate::routing::{MethodSet, RouteError, Router, RouterBuilder};

type HookFuture = BoxFuture<'static, Result<(), BoxError>>;
type Hook = Box<dyn Fn() -> HookFuture + Send + Sync + 'static>;

/// Setup-time registration surface.
pub struct AppBuilder {
    routes: RouterBuilder,
    errors: ErrorHandlers,
    startup: Vec<Hook>,
    cleanup: Vec<Hook>,
    debug: bool,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            routes: RouterBuilder::new(),
            errors: ErrorHandlers::new(false),
            startup: Vec::new(),
            cleanup: Vec::new(),
            debug: false,
        }
    }

    /// Register `handler` for `pattern` and the given methods.
    ///
    /// An empty method list registers the any-method fallback.
    pub fn route(mut self, methods: impl Into<MethodSet>, pattern: &str, handler: impl Handler) -> Self {
        self.routes.register(methods, pattern, handler);
        self
    }

    pub fn get(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::POST, pattern, handler)
    }

    pub fn put(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::PUT, pattern, handler)
    }

    pub fn patch(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::PATCH, pattern, handler)
    }

    pub fn delete(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::DELETE, pattern, handler)
    }

    pub fn options(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(Method::OPTIONS, pattern, handler)
    }

    /// Fallback for every method without a more specific route on `pattern`.
    pub fn any(self, pattern: &str, handler: impl Handler) -> Self {
        self.route(MethodSet::Any, pattern, handler)
    }

    /// Append an error handler; earlier registrations are tried first.
    pub fn error_handler<F>(mut self, matcher: ErrorMatcher, handler: F) -> Self
    where
        F: Fn(&RequestHead, &HandlerError) -> Result<Response, BoxError> + Send + Sync + 'static,
    {
        self.errors.push(matcher, handler);
        self
    }

    /// Run `hook` in every worker before it starts accepting.
    pub fn on_startup<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.startup.push(Box::new(move || Box::pin(hook())));
        self
    }

    /// Run `hook` in every worker after its connections have drained.
    pub fn on_cleanup<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.cleanup.push(Box::new(move || Box::pin(hook())));
        self
    }

    /// Include error detail in 500 responses.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn build(self) -> Result<App, RouteError> {
        let router = self.routes.compile()?;
        let mut errors = self.errors;
        errors.set_debug(self.debug);

        Ok(App {
            router,
            errors,
            startup: self.startup,
            cleanup: self.cleanup,
            debug: self.debug,
        })
    }
}

/// A compiled application: route table, error chain and hooks.
pub struct App {
    router: Router,
    errors: ErrorHandlers,
    startup: Vec<Hook>,
    cleanup: Vec<Hook>,
    debug: bool,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn errors(&self) -> &ErrorHandlers {
        &self.errors
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
        self.errors.set_debug(debug);
    }

    pub(crate) async fn run_startup(&self) -> Result<(), BoxError> {
        for hook in &self.startup {
            hook().await?;
        }
        Ok(())
    }

    pub(crate) async fn run_cleanup(&self) {
        for hook in &self.cleanup {
            if let Err(e) = hook().await {
                tracing::error!(error = %e, "Cleanup hook failed");
            }
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("routes", &self.router.len())
            .field("error_handlers", &self.errors.len())
            .field("startup_hooks", &self.startup.len())
            .field("cleanup_hooks", &self.cleanup.len())
            .field("debug", &self.debug)
            .finish()
    }
}
