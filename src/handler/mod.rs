//! Per-connection request handling.
//!
//! [`RequestHandler::service_request`] runs inside one worker-pool task and
//! owns the client connection for its whole lifetime:
//!
//! ```text
//! read request ──malformed──▶ 400 / 413 / 501
//!      │
//!      ▼
//! blacklist ──blocked──▶ 403
//!      │
//!      ▼
//! cache lookup ──hit──▶ cached response
//!      │ miss
//!      ▼
//! origin fetch ──unreachable──▶ drop connection
//!      │
//!      ▼
//! cache store (if cacheable) ──▶ response to client
//! ```
//!
//! Nothing escapes `service_request`: every error is logged and confined to
//! its own connection.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blacklist::Blacklist;
use crate::cache::ResponseCache;
use crate::http::{Request, RequestError, Response, ResponseError, StatusCode};

/// Maximum size of a client request we will buffer (8 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Maximum size of an origin response we will buffer (64 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Failures that end the handling of one connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    MalformedRequest(#[source] RequestError),

    #[error("host {0:?} is blacklisted")]
    ForbiddenHost(String),

    #[error("origin {server}:{port} unreachable: {source}")]
    OriginUnreachable {
        server: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("origin response unusable: {0}")]
    OriginResponse(#[from] ResponseError),

    #[error("client connection failed: {0}")]
    Client(#[source] io::Error),
}

/// Limits and timeouts applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    pub max_request_size: usize,
    pub max_response_size: usize,
    /// Bound on establishing the origin connection.
    pub connect_timeout: Duration,
    /// Per-read/per-write bound on client and origin sockets. `None` waits forever.
    pub io_timeout: Option<Duration>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            connect_timeout: Duration::from_secs(10),
            io_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Proxies one client connection: blacklist, cache, origin, client.
///
/// Shared across workers behind an [`Arc`]; it holds no per-request state.
#[derive(Debug)]
pub struct RequestHandler {
    blacklist: Arc<Blacklist>,
    cache: Arc<ResponseCache>,
    config: HandlerConfig,
}

impl RequestHandler {
    pub fn new(blacklist: Arc<Blacklist>, cache: Arc<ResponseCache>, config: HandlerConfig) -> Self {
        Self {
            blacklist,
            cache,
            config,
        }
    }

    /// Services the single request arriving on `client`, then closes it.
    ///
    /// Never fails and never panics outward; outcomes are reported through
    /// `tracing`.
    pub fn service_request(&self, client: TcpStream, peer: SocketAddr) {
        match self.proxy(client, peer) {
            Ok(()) => {}
            Err(e @ (ProxyError::MalformedRequest(_) | ProxyError::ForbiddenHost(_))) => {
                info!(%peer, error = %e, "request refused");
            }
            Err(e @ ProxyError::Client(_)) => {
                debug!(%peer, error = %e, "client went away");
            }
            Err(e) => {
                warn!(%peer, error = %e, "request dropped");
            }
        }
    }

    fn proxy(&self, mut client: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
        client
            .set_read_timeout(self.config.io_timeout)
            .and_then(|()| client.set_write_timeout(self.config.io_timeout))
            .map_err(ProxyError::Client)?;

        let mut request = match Request::read_from(&mut client, self.config.max_request_size) {
            Ok(request) => request,
            Err(RequestError::Closed) => return Ok(()),
            Err(RequestError::Io(e)) => return Err(ProxyError::Client(e)),
            Err(e) => {
                let status = match e {
                    RequestError::TooLarge { .. } => StatusCode::PayloadTooLarge,
                    RequestError::Tunnel | RequestError::UnsupportedScheme(_) => {
                        StatusCode::NotImplemented
                    }
                    _ => StatusCode::BadRequest,
                };
                let reply = Response::new(status).body(format!("{}: {e}", status.canonical_reason()));
                send(&mut client, &reply)?;
                return Err(ProxyError::MalformedRequest(e));
            }
        };

        debug!(%peer, method = %request.method(), url = %request.url(), "request received");

        if !self.blacklist.server_is_allowed(request.server()) {
            send(&mut client, &Response::new(StatusCode::Forbidden).body("Forbidden Content"))?;
            return Err(ProxyError::ForbiddenHost(request.server().to_owned()));
        }

        request.prepare_for_origin(peer.ip());

        if let Some(cached) = self.cache.lookup(&request) {
            return send(&mut client, &cached);
        }

        let response = self.fetch(&request)?;
        info!(
            %peer,
            method = %request.method(),
            url = %request.url(),
            status = response.status(),
            "forwarded"
        );

        if self.cache.should_cache(&request, &response) {
            if let Err(e) = self.cache.store(&request, &response) {
                warn!(url = %request.url(), error = %e, "failed to cache response");
            }
        }

        send(&mut client, &response)
    }

    /// Forwards `request` to its origin and reads the complete response.
    fn fetch(&self, request: &Request) -> Result<Response, ProxyError> {
        let unreachable = |source: io::Error| ProxyError::OriginUnreachable {
            server: request.server().to_owned(),
            port: request.port(),
            source,
        };

        let mut origin = self
            .connect(request.server(), request.port())
            .map_err(unreachable)?;
        origin
            .set_read_timeout(self.config.io_timeout)
            .and_then(|()| origin.set_write_timeout(self.config.io_timeout))
            .and_then(|()| origin.write_all(&request.to_bytes()))
            .and_then(|()| origin.flush())
            .map_err(unreachable)?;

        Ok(Response::read_from(
            &mut origin,
            request.method(),
            self.config.max_response_size,
        )?)
    }

    /// Resolves `server` and connects to the first address that answers.
    fn connect(&self, server: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in (server, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses found for {server}"))
        }))
    }
}

fn send(client: &mut TcpStream, response: &Response) -> Result<(), ProxyError> {
    client
        .write_all(&response.to_bytes())
        .and_then(|()| client.flush())
        .map_err(ProxyError::Client)
}
