//! HTTP/1.x request decoding.
//!
//! Incremental decoder fed from a connection's inbound buffer. Each call
//! consumes at most one request, so pipelined requests already in the buffer
//! are returned one after another.
//!
//! ```text
//! AwaitHead ──(head complete, no body)──────────────▶ request
//!     │
//!     └─(head complete, Content-Length > 0)─▶ ParsingBody ──(body complete)──▶ request
//! ```

use bytes::{Buf, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, StatusCode, Version};

use crate::config::ProtocolConfig;
use crate::http::request::{Request, RequestHead};

/// httparse requires a preallocated header array of this size.
pub const MAX_HEADERS: usize = 100;

/// Errors raised while decoding a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("request body of {length} bytes exceeds {limit} bytes")]
    BodyTooLarge { length: usize, limit: usize },
}

impl ProtocolError {
    /// Status of the minimal response written before closing.
    pub fn status(&self) -> StatusCode {
        match self {
            ProtocolError::Malformed(_) | ProtocolError::HeadTooLarge { .. } => StatusCode::BAD_REQUEST,
            ProtocolError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::HeadTooLarge { .. } => "head_too_large",
            ProtocolError::BodyTooLarge { .. } => "body_too_large",
        }
    }
}

/// Where the decoder is within the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    AwaitHead,
    ParsingBody,
}

#[derive(Debug)]
enum DecodeState {
    AwaitHead,
    ParsingBody { head: RequestHead, length: usize },
}

/// Incremental request decoder for one connection.
#[derive(Debug)]
pub struct RequestDecoder {
    state: DecodeState,
    max_head_size: usize,
    max_body_size: usize,
    remote_addr: Option<std::net::SocketAddr>,
}

impl RequestDecoder {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            state: DecodeState::AwaitHead,
            max_head_size: config.max_head_size,
            max_body_size: config.max_body_size,
            remote_addr: None,
        }
    }

    /// Stamp decoded requests with the peer address.
    pub fn with_remote_addr(mut self, addr: std::net::SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn phase(&self) -> DecodePhase {
        match self.state {
            DecodeState::AwaitHead => DecodePhase::AwaitHead,
            DecodeState::ParsingBody { .. } => DecodePhase::ParsingBody,
        }
    }

    /// Decode the next request from `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        if let DecodeState::AwaitHead = self.state {
            let Some((head, length)) = self.decode_head(buf)? else {
                return Ok(None);
            };
            match length {
                None => return Ok(Some(Request::new(head, None))),
                Some(length) => self.state = DecodeState::ParsingBody { head, length },
            }
        }

        let length = match &self.state {
            DecodeState::ParsingBody { length, .. } => *length,
            DecodeState::AwaitHead => return Ok(None),
        };
        if buf.len() < length {
            return Ok(None);
        }

        let body = buf.split_to(length).freeze();
        match std::mem::replace(&mut self.state, DecodeState::AwaitHead) {
            DecodeState::ParsingBody { head, .. } => Ok(Some(Request::new(head, Some(body)))),
            DecodeState::AwaitHead => Ok(None),
        }
    }

    fn decode_head(&self, buf: &mut BytesMut) -> Result<Option<(RequestHead, Option<usize>)>, ProtocolError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);

        let head_len = match parsed.parse(&buf[..]) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > self.max_head_size {
                    return Err(ProtocolError::HeadTooLarge { limit: self.max_head_size });
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ProtocolError::Malformed(format!("more than {} headers", MAX_HEADERS)));
            }
            Err(e) => return Err(ProtocolError::Malformed(e.to_string())),
        };
        if head_len > self.max_head_size {
            return Err(ProtocolError::HeadTooLarge { limit: self.max_head_size });
        }

        let method = parsed
            .method
            .ok_or_else(|| ProtocolError::Malformed("missing method".into()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ProtocolError::Malformed(format!("invalid method `{}`", method)))?;

        let target = parsed
            .path
            .ok_or_else(|| ProtocolError::Malformed("missing request target".into()))?;
        if !target.starts_with('/') {
            return Err(ProtocolError::Malformed(format!("unsupported request target `{}`", target)));
        }
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };

        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            _ => return Err(ProtocolError::Malformed("unsupported HTTP version".into())),
        };

        let mut header_map = HeaderMap::with_capacity(parsed.headers.len());
        for header in parsed.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|_| ProtocolError::Malformed(format!("invalid header name `{}`", header.name)))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|_| ProtocolError::Malformed(format!("invalid value for header `{}`", header.name)))?;
            header_map.append(name, value);
        }

        let length = self.body_length(&header_map)?;
        buf.advance(head_len);

        let head = RequestHead {
            method,
            path,
            query,
            version,
            headers: header_map,
            remote_addr: self.remote_addr,
        };
        Ok(Some((head, length)))
    }

    fn body_length(&self, headers: &HeaderMap) -> Result<Option<usize>, ProtocolError> {
        if headers.contains_key(TRANSFER_ENCODING) {
            return Err(ProtocolError::Malformed("transfer-encoding is not supported".into()));
        }

        let mut length: Option<usize> = None;
        for value in headers.get_all(CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or_else(|| ProtocolError::Malformed("invalid content-length".into()))?;
            if matches!(length, Some(previous) if previous != parsed) {
                return Err(ProtocolError::Malformed("conflicting content-length".into()));
            }
            length = Some(parsed);
        }

        match length {
            Some(0) | None => Ok(None),
            Some(length) if length > self.max_body_size => Err(ProtocolError::BodyTooLarge {
                length,
                limit: self.max_body_size,
            }),
            Some(length) => Ok(Some(length)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> RequestDecoder {
        RequestDecoder::new(&ProtocolConfig::default())
    }

    fn buf(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    #[test]
    fn decodes_simple_get() {
        let mut input = buf(b"GET /params/1/2?x=y HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let request = decoder().decode(&mut input).unwrap().unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.path(), "/params/1/2");
        assert_eq!(request.query(), Some("x=y"));
        assert_eq!(request.header("host"), Some("example.com"));
        assert!(request.body().is_none());
        assert!(input.is_empty());
    }

    #[test]
    fn too_many_headers_is_not_reported_as_oversized() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend_from_slice(format!("x-{}: 1\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        assert!(raw.len() < ProtocolConfig::default().max_head_size);

        let err = decoder().decode(&mut buf(&raw)).unwrap_err();
        assert_eq!(err, ProtocolError::Malformed(format!("more than {} headers", MAX_HEADERS)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn waits_for_complete_head_and_body() {
        let mut decoder = decoder();
        let mut input = buf(b"POST /echo HTTP/1.1\r\nContent-Len");
        assert!(decoder.decode(&mut input).unwrap().is_none());
        assert_eq!(decoder.phase(), DecodePhase::AwaitHead);

        input.extend_from_slice(b"gth: 5\r\n\r\nhel");
        assert!(decoder.decode(&mut input).unwrap().is_none());
        assert_eq!(decoder.phase(), DecodePhase::ParsingBody);

        input.extend_from_slice(b"lo");
        let request = decoder.decode(&mut input).unwrap().unwrap();
        assert_eq!(request.body().map(|b| b.as_ref()), Some(&b"hello"[..]));
        assert_eq!(decoder.phase(), DecodePhase::AwaitHead);
    }

    #[test]
    fn pipelined_requests_come_out_in_order() {
        let mut decoder = decoder();
        let mut input = buf(
            b"GET /first HTTP/1.1\r\n\r\nPOST /second HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /third HTTP/1.1\r\n\r\n",
        );

        let paths: Vec<String> = std::iter::from_fn(|| decoder.decode(&mut input).unwrap())
            .map(|r| r.path().to_string())
            .collect();
        assert_eq!(paths, ["/first", "/second", "/third"]);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = decoder().decode(&mut buf(b"\x01\x02 nonsense\r\n\r\n")).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oversized_head_is_rejected() {
        let config = ProtocolConfig {
            max_head_size: 32,
            ..ProtocolConfig::default()
        };
        let mut decoder = RequestDecoder::new(&config);
        let mut input = buf(b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(
            decoder.decode(&mut input).unwrap_err(),
            ProtocolError::HeadTooLarge { limit: 32 }
        );
    }

    #[test]
    fn oversized_body_is_rejected_before_buffering() {
        let config = ProtocolConfig {
            max_body_size: 4,
            ..ProtocolConfig::default()
        };
        let err = RequestDecoder::new(&config)
            .decode(&mut buf(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n"))
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn bad_content_length_is_malformed() {
        for raw in [
            &b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n"[..],
            b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        ] {
            assert!(matches!(
                decoder().decode(&mut buf(raw)),
                Err(ProtocolError::Malformed(_))
            ));
        }
    }

    #[test]
    fn absolute_targets_are_rejected() {
        let err = decoder()
            .decode(&mut buf(b"GET http://example.com/ HTTP/1.1\r\n\r\n"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn http10_is_recognised() {
        let request = decoder()
            .decode(&mut buf(b"GET / HTTP/1.0\r\n\r\n"))
            .unwrap()
            .unwrap();
        assert_eq!(request.head().version(), Version::HTTP_10);
        assert!(!request.head().keep_alive());
    }
}
