//! Parsed request types.
//!
//! # Responsibilities
//! - Hold the parsed head (method, path, query, version, headers)
//! - Carry the length-delimited body and the router's path parameters
//! - Decide keep-alive from version and `Connection` header
//!
//! # Design Decisions
//! - The head is shared (`Arc`) so the engine keeps it for error handling
//!   and access logging while the handler owns the request
//! - Header names are case-insensitive (`http::HeaderMap`)

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, CONNECTION};
use http::{Method, Version};

use crate::routing::PathParams;

/// Request line and headers of one request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl RequestHead {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path without the query string, exactly as sent (no normalization).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether the connection stays open after this request's response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is sent;
    /// HTTP/1.0 closes unless `Connection: keep-alive` is sent.
    pub fn keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers.get_all(CONNECTION).iter().any(|value| {
                value
                    .to_str()
                    .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                    .unwrap_or(false)
            })
        };

        match self.version {
            Version::HTTP_10 => has_token("keep-alive"),
            _ => !has_token("close"),
        }
    }
}

/// A fully parsed request handed to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    head: Arc<RequestHead>,
    params: PathParams,
    body: Option<Bytes>,
}

impl Request {
    pub(crate) fn new(head: RequestHead, body: Option<Bytes>) -> Self {
        Self {
            head: Arc::new(head),
            params: PathParams::default(),
            body,
        }
    }

    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    pub(crate) fn shared_head(&self) -> Arc<RequestHead> {
        Arc::clone(&self.head)
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.head.query()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// Body bytes; present only when the request declared a Content-Length.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    /// Parameters extracted from `{name}` segments of the matched route.
    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }
}

#[cfg(test)]
pub(crate) fn head_for_test(method: Method, path: &str) -> RequestHead {
    RequestHead {
        method,
        path: path.to_string(),
        query: None,
        version: Version::HTTP_11,
        headers: HeaderMap::new(),
        remote_addr: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn head(version: Version, connection: Option<&'static str>) -> RequestHead {
        let mut head = head_for_test(Method::GET, "/");
        head.version = version;
        if let Some(value) = connection {
            head.headers.insert(CONNECTION, HeaderValue::from_static(value));
        }
        head
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        assert!(head(Version::HTTP_11, None).keep_alive());
        assert!(!head(Version::HTTP_10, None).keep_alive());
    }

    #[test]
    fn connection_header_overrides_default() {
        assert!(!head(Version::HTTP_11, Some("close")).keep_alive());
        assert!(!head(Version::HTTP_11, Some("Upgrade, Close")).keep_alive());
        assert!(head(Version::HTTP_10, Some("Keep-Alive")).keep_alive());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut head = head_for_test(Method::GET, "/");
        head.headers.insert("user-agent", HeaderValue::from_static("curl"));
        assert_eq!(head.header("User-Agent"), Some("curl"));
    }
}
