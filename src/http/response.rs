//! Responses and their wire encoding.
//!
//! # Responsibilities
//! - Build responses (status, headers, body)
//! - Serialize to HTTP/1.x bytes with framing headers owned by the engine
//!
//! # Design Decisions
//! - `Content-Length` and `Connection` are always written by the encoder;
//!   values a handler sets for them are ignored (except `Connection: close`,
//!   which asks the engine to close after writing)
//! - HEAD responses keep `Content-Length` but omit the body

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{StatusCode, Version};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// A response produced by a handler or an error handler.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Empty response with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// `200 OK` with a UTF-8 text body.
    pub fn text(body: impl Into<String>) -> Self {
        Self::text_with_status(StatusCode::OK, body)
    }

    pub fn text_with_status(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        response.body = Bytes::from(body.into());
        response
    }

    /// `200 OK` with an opaque byte body.
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        response.body = body.into();
        response
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The handler asked for the connection to be closed after this response.
    pub(crate) fn wants_close(&self) -> bool {
        self.headers.get_all(CONNECTION).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
                .unwrap_or(false)
        })
    }

    /// Append the wire form of this response to `dst`.
    pub(crate) fn encode(&self, version: Version, keep_alive: bool, head_only: bool, dst: &mut BytesMut) {
        let version = match version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        let reason = self.status.canonical_reason().unwrap_or("Unknown");

        dst.reserve(128 + self.body.len());
        let _ = write!(dst, "{} {} {}\r\n", version, self.status.as_u16(), reason);

        for (name, value) in &self.headers {
            if name == CONTENT_LENGTH || name == CONNECTION {
                continue;
            }
            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }

        let _ = write!(dst, "Content-Length: {}\r\n", self.body.len());
        if !keep_alive {
            dst.put_slice(b"Connection: close\r\n");
        } else if version == "HTTP/1.0" {
            dst.put_slice(b"Connection: keep-alive\r\n");
        }
        dst.put_slice(b"\r\n");

        if !head_only {
            dst.put_slice(&self.body);
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// Minimal response for a request the protocol layer could not accept.
///
/// Always HTTP/1.0 and always followed by closing the connection.
pub(crate) fn protocol_error_response(status: StatusCode, message: &str) -> BytesMut {
    let mut dst = BytesMut::new();
    Response::text_with_status(status, message).encode(Version::HTTP_10, false, false, &mut dst);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(response: &Response, version: Version, keep_alive: bool, head_only: bool) -> String {
        let mut dst = BytesMut::new();
        response.encode(version, keep_alive, head_only, &mut dst);
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn encodes_text_response() {
        let wire = encoded(&Response::text("hello"), Version::HTTP_11, true, false);
        assert_eq!(
            wire,
            "HTTP/1.1 200 OK\r\ncontent-type: text/plain; charset=utf-8\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn closing_response_says_so() {
        let wire = encoded(&Response::new(StatusCode::NO_CONTENT), Version::HTTP_11, false, false);
        assert_eq!(wire, "HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    }

    #[test]
    fn http10_keep_alive_is_echoed() {
        let wire = encoded(&Response::default(), Version::HTTP_10, true, false);
        assert!(wire.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(wire.contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn head_response_omits_body_but_keeps_length() {
        let wire = encoded(&Response::text("abc"), Version::HTTP_11, true, true);
        assert!(wire.contains("Content-Length: 3\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn handler_framing_headers_are_replaced() {
        let response = Response::text("x")
            .with_header(CONTENT_LENGTH, HeaderValue::from_static("999"))
            .with_header(CONNECTION, HeaderValue::from_static("close"));
        assert!(response.wants_close());

        let wire = encoded(&response, Version::HTTP_11, false, false);
        assert!(!wire.contains("999"));
        assert_eq!(wire.matches("Connection").count(), 1);
    }

    #[test]
    fn bad_request_is_minimal_http10() {
        let wire = protocol_error_response(StatusCode::BAD_REQUEST, "bad request line");
        let wire = String::from_utf8(wire.to_vec()).unwrap();
        assert_eq!(
            wire,
            "HTTP/1.0 400 Bad Request\r\ncontent-type: text/plain; charset=utf-8\r\nContent-Length: 16\r\nConnection: close\r\n\r\nbad request line"
        );
    }
}
