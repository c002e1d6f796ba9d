//! HTTP/1.x responses: origin replies relayed by the proxy and the small
//! error replies the proxy writes itself.
//!
//! A [`Response`] always carries a self-delimiting header set: responses
//! built with [`Response::new`] maintain their own `Content-Length`, and
//! origin responses read until end of stream have one added. That makes
//! [`Response::to_bytes`] a verbatim serialization, which is what lets the
//! cache store and replay a response byte-for-byte.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, INITIAL_BUF_SIZE, MAX_HEADERS, Method, StatusCode, fill_buf};

/// Errors that can occur while reading or parsing a response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete: stream ended early")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {0:?}")]
    InvalidContentLength(String),

    #[error("response exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed status line and headers, plus where the body starts.
struct Head {
    version: u8,
    status: u16,
    reason: String,
    headers: Headers,
    body_offset: usize,
}

/// An HTTP/1.x response.
///
/// # Examples
///
/// ```
/// use rttp_proxy::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Forbidden).body("Forbidden Content");
///
/// let bytes = response.to_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
/// assert!(text.contains("Content-Length: 17\r\n"));
/// assert!(text.ends_with("\r\n\r\nForbidden Content"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    status: u16,
    reason: String,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Creates a new HTTP/1.1 response with the given status and an empty body.
    ///
    /// The proxy closes every client connection after one exchange, so
    /// generated responses carry `Connection: close`.
    pub fn new(status: StatusCode) -> Self {
        let mut headers = Headers::new();
        headers.insert("Connection", "close");
        headers.insert("Content-Length", "0");
        Self {
            version: 1,
            status: status.as_u16(),
            reason: status.canonical_reason().to_owned(),
            headers,
            body: Bytes::new(),
        }
    }

    /// Sets a response header, replacing any previous value.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Sets a plain-text body and updates `Content-Type` and `Content-Length`.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        if !self.headers.contains("content-type") {
            self.headers.set("Content-Type", "text/plain; charset=utf-8");
        }
        self.body_bytes(body.into().into_bytes())
    }

    /// Sets the body from raw bytes and updates `Content-Length`.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.headers.set("Content-Length", self.body.len().to_string());
        self
    }

    /// Reads a complete response from `reader`.
    ///
    /// The body is framed by `Content-Length` when present. Otherwise it runs
    /// to end of stream, and a `Content-Length` header is added so the result
    /// re-serializes as a self-delimiting message. Responses to `HEAD`, and
    /// `1xx`/`204`/`304` responses, have no body.
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`]: the stream ended before the head, or
    ///   before the declared body, was complete.
    /// - [`ResponseError::TooLarge`]: more than `max_size` bytes arrived.
    /// - [`ResponseError::Parse`] / [`ResponseError::InvalidContentLength`]:
    ///   the head is malformed.
    pub fn read_from<R: Read + ?Sized>(
        reader: &mut R,
        request_method: &Method,
        max_size: usize,
    ) -> Result<Self, ResponseError> {
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let too_large = ResponseError::TooLarge {
            max_bytes: max_size,
        };

        let head = loop {
            if let Some(head) = parse_head(&buf)? {
                break head;
            }
            if fill_buf(reader, &mut buf)? == 0 {
                return Err(ResponseError::Incomplete);
            }
            if buf.len() > max_size {
                return Err(too_large);
            }
        };

        let bodyless = request_method.expects_bodyless_response()
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304;

        let body_end = if bodyless {
            head.body_offset
        } else {
            match framed_length(&head.headers)? {
                Some(len) => {
                    let end = head
                        .body_offset
                        .checked_add(len)
                        .filter(|&end| end <= max_size)
                        .ok_or(too_large)?;
                    while buf.len() < end {
                        if fill_buf(reader, &mut buf)? == 0 {
                            return Err(ResponseError::Incomplete);
                        }
                    }
                    end
                }
                None => {
                    while fill_buf(reader, &mut buf)? > 0 {
                        if buf.len() > max_size {
                            return Err(too_large);
                        }
                    }
                    buf.len()
                }
            }
        };

        let mut response = Self::from_head(head, &buf, body_end);
        if !bodyless && !response.is_self_delimiting() {
            response
                .headers
                .set("Content-Length", response.body.len().to_string());
        }
        Ok(response)
    }

    /// Parses a complete response held in memory, as written by
    /// [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// - [`ResponseError::Incomplete`]: the head is cut short, or the body is
    ///   shorter than its `Content-Length`.
    /// - [`ResponseError::Parse`] / [`ResponseError::InvalidContentLength`]:
    ///   the head is malformed.
    pub fn parse(buf: &[u8]) -> Result<Self, ResponseError> {
        let head = parse_head(buf)?.ok_or(ResponseError::Incomplete)?;
        let body_end = match framed_length(&head.headers)? {
            Some(len) => head
                .body_offset
                .checked_add(len)
                .ok_or_else(|| ResponseError::InvalidContentLength(len.to_string()))?,
            None => buf.len(),
        };
        if buf.len() < body_end {
            return Err(ResponseError::Incomplete);
        }
        Ok(Self::from_head(head, buf, body_end))
    }

    fn from_head(head: Head, buf: &[u8], body_end: usize) -> Self {
        Self {
            version: head.version,
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body: Bytes::copy_from_slice(&buf[head.body_offset..body_end]),
        }
    }

    /// Returns the numeric status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the reason phrase from the status line.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the HTTP minor version number.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response payload.
    pub fn payload(&self) -> &Bytes {
        &self.body
    }

    /// Returns the freshness lifetime in seconds granted by `Cache-Control`.
    ///
    /// `s-maxage` wins over `max-age`, since this is a shared cache. Missing
    /// or unparseable directives yield `0`.
    pub fn ttl(&self) -> u64 {
        let mut max_age = None;
        let mut s_maxage = None;
        for (name, value) in self.cache_directives() {
            let parsed = value.and_then(|v| v.trim_matches('"').parse::<u64>().ok());
            match name.as_str() {
                "s-maxage" => s_maxage = parsed,
                "max-age" => max_age = parsed,
                _ => {}
            }
        }
        s_maxage.or(max_age).unwrap_or(0)
    }

    /// Returns `true` if the origin allows a shared cache to store this response.
    ///
    /// `no-store`, `no-cache`, and `private` forbid it; otherwise the response
    /// must carry a positive freshness lifetime.
    pub fn permits_caching(&self) -> bool {
        let forbidden = self
            .cache_directives()
            .any(|(name, _)| matches!(name.as_str(), "no-store" | "no-cache" | "private"));
        !forbidden && self.ttl() > 0
    }

    /// Serializes the response in wire format: status line, headers, a blank
    /// line, and the payload.
    pub fn to_bytes(&self) -> BytesMut {
        let head = format!(
            "HTTP/1.{} {} {}\r\n{}\r\n",
            self.version, self.status, self.reason, self.headers
        );
        let mut buf = BytesMut::with_capacity(head.len() + self.body.len());
        buf.put(head.as_bytes());
        buf.put(self.body.as_ref());
        buf
    }

    fn is_self_delimiting(&self) -> bool {
        self.headers.contains("content-length") || self.headers.contains("transfer-encoding")
    }

    /// Iterates `Cache-Control` directives as lowercased `(name, value)` pairs.
    fn cache_directives(&self) -> impl Iterator<Item = (String, Option<&str>)> {
        self.headers
            .get_all("cache-control")
            .flat_map(|value| value.split(','))
            .filter_map(|directive| {
                let directive = directive.trim();
                if directive.is_empty() {
                    return None;
                }
                let mut parts = directive.splitn(2, '=');
                let name = parts.next()?.trim().to_ascii_lowercase();
                Some((name, parts.next().map(str::trim)))
            })
    }
}

/// Parses the status line and headers. `Ok(None)` means more data is needed.
fn parse_head(buf: &[u8]) -> Result<Option<Head>, ResponseError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut raw_headers);

    let body_offset = match raw.parse(buf)? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => return Ok(None),
    };

    Ok(Some(Head {
        version: raw
            .version
            .ok_or(ResponseError::MissingField { field: "version" })?,
        status: raw
            .code
            .ok_or(ResponseError::MissingField { field: "status" })?,
        reason: raw.reason.unwrap_or_default().to_owned(),
        headers: Headers::from_parsed(raw.headers),
        body_offset,
    }))
}

/// Returns the body length declared by `Content-Length`, unless the message
/// is chunked (in which case the raw chunked body runs to end of stream).
fn framed_length(headers: &Headers) -> Result<Option<usize>, ResponseError> {
    if headers.contains("transfer-encoding") {
        return Ok(None);
    }
    match headers.content_length() {
        Some(Ok(len)) => Ok(Some(len)),
        Some(Err(raw)) => Err(ResponseError::InvalidContentLength(raw)),
        None => Ok(None),
    }
}
