//! Route lookup and dispatch.
//!
//! # Responsibilities
//! - Collect (method set, pattern, handler) registrations during setup
//! - Compile them once into a segment trie
//! - Match (method, path) to a handler plus extracted path parameters
//!
//! # Design Decisions
//! - Immutable after compilation (shared without locks)
//! - Literal children are tried before the parameter child at every depth,
//!   so specificity decides, never registration order
//! - A terminal without a handler for the method counts as a miss and the
//!   search backtracks into the parameter branch
//! - Collisions are reported by `compile`, never at request time

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::http::Handler;
use crate::routing::pattern::{split_path, PathPattern, Segment};

/// Errors raised while compiling the route table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("route pattern `{pattern}` repeats parameter `{name}`")]
    DuplicateParam { pattern: String, name: String },
    #[error("route `{pattern}` collides with `{existing}` for method {method}")]
    Conflict {
        pattern: String,
        existing: String,
        method: String,
    },
}

/// Methods a route answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSet {
    /// Any method; used when no more specific entry exists on the path.
    Any,
    Only(Vec<Method>),
}

impl From<Method> for MethodSet {
    fn from(method: Method) -> Self {
        MethodSet::Only(vec![method])
    }
}

/// An empty list registers the any-method route.
impl From<Vec<Method>> for MethodSet {
    fn from(methods: Vec<Method>) -> Self {
        if methods.is_empty() {
            MethodSet::Any
        } else {
            MethodSet::Only(methods)
        }
    }
}

impl<const N: usize> From<[Method; N]> for MethodSet {
    fn from(methods: [Method; N]) -> Self {
        MethodSet::from(methods.to_vec())
    }
}

/// Parameters extracted from `{name}` segments; names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(Arc<str>, String)>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.as_ref() == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_ref(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct Endpoint {
    handler: Arc<dyn Handler>,
    param_names: Arc<[Arc<str>]>,
    pattern: Arc<str>,
}

#[derive(Default)]
struct Endpoints {
    by_method: HashMap<Method, Endpoint>,
    any: Option<Endpoint>,
}

impl Endpoints {
    fn lookup(&self, method: &Method) -> Option<&Endpoint> {
        self.by_method.get(method).or(self.any.as_ref())
    }
}

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    endpoints: Option<Endpoints>,
}

impl Node {
    fn find<'a, 'p>(
        &'a self,
        segments: &[&'p str],
        method: &Method,
        values: &mut Vec<&'p str>,
    ) -> Option<&'a Endpoint> {
        let Some((segment, rest)) = segments.split_first() else {
            return self.endpoints.as_ref()?.lookup(method);
        };

        if let Some(child) = self.literals.get(*segment) {
            if let Some(found) = child.find(rest, method, values) {
                return Some(found);
            }
        }

        if segment.is_empty() {
            return None;
        }
        let child = self.param.as_ref()?;
        values.push(*segment);
        let found = child.find(rest, method, values);
        if found.is_none() {
            values.pop();
        }
        found
    }
}

struct Registration {
    methods: MethodSet,
    pattern: String,
    handler: Arc<dyn Handler>,
}

/// Collects routes during setup.
#[derive(Default)]
pub struct RouterBuilder {
    registrations: Vec<Registration>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route; validation happens in [`RouterBuilder::compile`].
    pub fn register(&mut self, methods: impl Into<MethodSet>, pattern: &str, handler: impl Handler) -> &mut Self {
        self.registrations.push(Registration {
            methods: methods.into(),
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Compile every registration into the immutable route table.
    pub fn compile(self) -> Result<Router, RouteError> {
        let mut root = Node::default();
        let count = self.registrations.len();

        for registration in self.registrations {
            let pattern = PathPattern::parse(&registration.pattern)?;
            let param_names: Arc<[Arc<str>]> = pattern.param_names().map(Arc::from).collect();
            let pattern_str: Arc<str> = Arc::from(pattern.as_str());

            let mut node = &mut root;
            for segment in pattern.segments() {
                node = match segment {
                    Segment::Literal(text) => node.literals.entry(text.clone()).or_default(),
                    Segment::Param(_) => node.param.get_or_insert_with(Box::default),
                };
            }

            let endpoints = node.endpoints.get_or_insert_with(Endpoints::default);
            let endpoint = || Endpoint {
                handler: Arc::clone(&registration.handler),
                param_names: Arc::clone(&param_names),
                pattern: Arc::clone(&pattern_str),
            };

            match &registration.methods {
                MethodSet::Any => {
                    if let Some(existing) = &endpoints.any {
                        return Err(conflict(&pattern_str, &existing.pattern, "*"));
                    }
                    endpoints.any = Some(endpoint());
                }
                MethodSet::Only(methods) => {
                    let mut unique: Vec<&Method> = Vec::new();
                    for method in methods {
                        if unique.contains(&method) {
                            continue;
                        }
                        unique.push(method);
                        if let Some(existing) = endpoints.by_method.get(method) {
                            return Err(conflict(&pattern_str, &existing.pattern, method.as_str()));
                        }
                        endpoints.by_method.insert(method.clone(), endpoint());
                    }
                }
            }
        }

        tracing::debug!(routes = count, "Route table compiled");
        Ok(Router { root, routes: count })
    }
}

fn conflict(pattern: &str, existing: &str, method: &str) -> RouteError {
    RouteError::Conflict {
        pattern: pattern.to_string(),
        existing: existing.to_string(),
        method: method.to_string(),
    }
}

/// A successful lookup.
pub struct RouteMatch<'a> {
    pub handler: &'a Arc<dyn Handler>,
    pub params: PathParams,
    pub pattern: &'a str,
}

/// Compiled, read-only route table.
pub struct Router {
    root: Node,
    routes: usize,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Number of registrations compiled into this table.
    pub fn len(&self) -> usize {
        self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes == 0
    }

    /// Find the handler for a request, or `None` for "not found".
    pub fn match_route(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let segments: Vec<&str> = split_path(path)?.collect();
        let mut values = Vec::new();
        let endpoint = self.root.find(&segments, method, &mut values)?;

        let params = endpoint
            .param_names
            .iter()
            .cloned()
            .zip(values.into_iter().map(str::to_string))
            .collect();

        Some(RouteMatch {
            handler: &endpoint.handler,
            params: PathParams(params),
            pattern: &endpoint.pattern,
        })
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("routes", &self.routes).finish()
    }
}
