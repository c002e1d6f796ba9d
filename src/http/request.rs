//! Proxy-side HTTP/1.x requests, parsed with the [`httparse`] crate.
//!
//! Clients talking to a forward proxy send absolute-form targets
//! (`GET http://host:port/path HTTP/1.1`). Origin-form targets are accepted
//! too when a `Host` header names the origin. Either way the request is
//! resolved to an origin `server`, `port`, and `path`, and is re-serialized
//! in origin-form when forwarded.

use std::io::Read;
use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use url::Url;

use super::{Headers, INITIAL_BUF_SIZE, MAX_HEADERS, Method, fill_buf};

/// Errors that can occur while reading or parsing a client request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("client closed the connection without sending a request")]
    Closed,

    #[error("request is incomplete: more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid request target {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme {0:?}; only plain http is proxied")]
    UnsupportedScheme(String),

    #[error("CONNECT tunnelling is not supported")]
    Tunnel,

    #[error("invalid Content-Length header: {0:?}")]
    InvalidContentLength(String),

    #[error("request exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully read client request addressed to some origin server.
///
/// # Examples
///
/// ```
/// use rttp_proxy::http::Request;
///
/// let raw = b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
/// let request = Request::read_from(&mut &raw[..], 8192).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.server(), "example.com");
/// assert_eq!(request.port(), 80);
/// assert_eq!(request.path(), "/a?b=1");
/// assert_eq!(request.url(), "http://example.com:80/a?b=1");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    /// Canonical absolute URL, `http://server:port/path?query`.
    url: String,
    server: String,
    port: u16,
    /// Path plus query, as sent to the origin.
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Reads one complete request (head and `Content-Length` body) from `reader`.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Closed`]: the stream ended before any byte arrived.
    /// - [`RequestError::Incomplete`]: the stream ended mid-request.
    /// - [`RequestError::TooLarge`]: more than `max_size` bytes were buffered.
    /// - Any parse or target-resolution error from [`Request::parse`].
    pub fn read_from<R: Read + ?Sized>(
        reader: &mut R,
        max_size: usize,
    ) -> Result<Self, RequestError> {
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

        loop {
            if fill_buf(reader, &mut buf)? == 0 {
                return Err(if buf.is_empty() {
                    RequestError::Closed
                } else {
                    RequestError::Incomplete
                });
            }

            if buf.len() > max_size {
                return Err(RequestError::TooLarge {
                    max_bytes: max_size,
                });
            }

            match Self::parse(&buf) {
                Ok(request) => return Ok(request),
                Err(RequestError::Incomplete) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Parses a complete request from a byte slice.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the head or the declared body is not
    ///   fully present in `buf`.
    /// - [`RequestError::Parse`]: the head is malformed.
    /// - [`RequestError::MissingField`]: no method, target, version, or (for
    ///   origin-form targets) `Host` header.
    /// - [`RequestError::InvalidTarget`], [`RequestError::UnsupportedScheme`],
    ///   [`RequestError::Tunnel`]: the target does not name a plain-http origin.
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut raw_headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
        {
            Ok(method) => method,
            Err(never) => match never {},
        };
        if method == Method::Connect {
            return Err(RequestError::Tunnel);
        }

        let target = raw
            .path
            .ok_or(RequestError::MissingField { field: "target" })?;
        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;
        let headers = Headers::from_parsed(raw.headers);

        let origin = resolve_target(target, &headers)?;
        let server = origin
            .host_str()
            .ok_or(RequestError::MissingField { field: "host" })?
            .to_owned();
        let port = origin.port_or_known_default().unwrap_or(80);
        let path = match origin.query() {
            Some(query) => format!("{}?{query}", origin.path()),
            None => origin.path().to_owned(),
        };

        let content_length = match headers.content_length() {
            Some(Ok(len)) => len,
            Some(Err(raw)) => return Err(RequestError::InvalidContentLength(raw)),
            None => 0,
        };
        let body_end = body_offset
            .checked_add(content_length)
            .ok_or_else(|| RequestError::InvalidContentLength(content_length.to_string()))?;
        if buf.len() < body_end {
            return Err(RequestError::Incomplete);
        }

        Ok(Self {
            method,
            url: format!("http://{server}:{port}{path}"),
            server,
            port,
            path,
            version,
            headers,
            body: Bytes::copy_from_slice(&buf[body_offset..body_end]),
        })
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the canonical absolute URL, always with an explicit port.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the origin host name (lowercased by URL normalization).
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Returns the origin port; `80` when the target did not name one.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the path and query as forwarded to the origin.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Rewrites hop-by-hop and forwarding headers before the request leaves
    /// the proxy.
    ///
    /// - `x-forwarded-proto` is set to `http`.
    /// - `client` is appended to `x-forwarded-for`.
    /// - `Connection: close` replaces any client preference, and
    ///   `Proxy-Connection`/`Keep-Alive` are dropped. The proxy reads each
    ///   origin response to completion and closes.
    /// - A `Host` header is added if the client omitted one.
    pub fn prepare_for_origin(&mut self, client: IpAddr) {
        let forwarded_for = match self.headers.get("x-forwarded-for") {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client}"),
            _ => client.to_string(),
        };
        self.headers.set("x-forwarded-for", forwarded_for);
        self.headers.set("x-forwarded-proto", "http");

        self.headers.remove("proxy-connection");
        self.headers.remove("keep-alive");
        self.headers.set("Connection", "close");

        if !self.headers.contains("host") {
            let host = if self.port == 80 {
                self.server.clone()
            } else {
                format!("{}:{}", self.server, self.port)
            };
            self.headers.insert("Host", host);
        }
    }

    /// Serializes the request in origin-form, ready to be written to the
    /// origin server.
    pub fn to_bytes(&self) -> BytesMut {
        let head = format!(
            "{} {} HTTP/1.{}\r\n{}\r\n",
            self.method, self.path, self.version, self.headers
        );
        let mut buf = BytesMut::with_capacity(head.len() + self.body.len());
        buf.put(head.as_bytes());
        buf.put(self.body.as_ref());
        buf
    }
}

/// Turns an absolute-form or origin-form target into an absolute URL.
fn resolve_target(target: &str, headers: &Headers) -> Result<Url, RequestError> {
    let absolute = if target.starts_with('/') {
        let host = headers
            .get("host")
            .ok_or(RequestError::MissingField { field: "host" })?;
        format!("http://{}{target}", host.trim())
    } else {
        target.to_owned()
    };

    let url = Url::parse(&absolute).map_err(|source| RequestError::InvalidTarget {
        target: target.to_owned(),
        source,
    })?;

    if url.scheme() != "http" {
        return Err(RequestError::UnsupportedScheme(url.scheme().to_owned()));
    }
    Ok(url)
}
