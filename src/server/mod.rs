//! TCP listener for the proxy.
//!
//! The listener thread only accepts. Each accepted connection is handed to
//! the [`Scheduler`], and all request handling happens on pool workers.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::ProxyConfig;
use crate::scheduler::Scheduler;

/// Pause after a failed `accept`, so a persistent failure such as running
/// out of file descriptors neither spins the listener nor floods the log.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors produced by the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// The proxy's accept loop.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_proxy::blacklist::Blacklist;
/// use rttp_proxy::cache::{CacheConfig, ResponseCache};
/// use rttp_proxy::handler::{HandlerConfig, RequestHandler};
/// use rttp_proxy::pool::ThreadPool;
/// use rttp_proxy::scheduler::Scheduler;
/// use rttp_proxy::server::ProxyServer;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let handler = RequestHandler::new(
///         Arc::new(Blacklist::default()),
///         Arc::new(ResponseCache::open("/tmp/proxy-cache", CacheConfig::default())?),
///         HandlerConfig::default(),
///     );
///     let scheduler = Scheduler::new(ThreadPool::new(16)?, Arc::new(handler));
///     let server = ProxyServer::bind_to("127.0.0.1:3128", scheduler)?;
///     server.run();
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    scheduler: Scheduler,
}

impl ProxyServer {
    /// Binds `0.0.0.0` on the configured port.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the port cannot be bound
    /// (e.g. already in use, insufficient permissions).
    pub fn bind(config: &ProxyConfig, scheduler: Scheduler) -> Result<Self, ServerError> {
        Self::bind_to(("0.0.0.0", config.port), scheduler)
    }

    /// Binds an explicit address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub fn bind_to<A>(addr: A, scheduler: Scheduler) -> Result<Self, ServerError>
    where
        A: ToSocketAddrs + fmt::Debug,
    {
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: format!("{addr:?}"),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            scheduler,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever.
    ///
    /// A failed `accept` is logged and the loop carries on after a short pause.
    pub fn run(&self) {
        info!(address = %self.local_addr, "proxy listening");
        loop {
            self.accept_one();
        }
    }

    /// Accepts exactly `count` connections, then returns.
    ///
    /// The connections may still be in flight; use [`ProxyServer::wait`] or
    /// [`ProxyServer::shutdown`] to let them finish.
    pub fn serve_n(&self, count: usize) {
        debug!(address = %self.local_addr, count, "serving a bounded number of connections");
        let mut accepted = 0;
        while accepted < count {
            if self.accept_one() {
                accepted += 1;
            }
        }
    }

    /// Blocks until every accepted connection has been serviced.
    pub fn wait(&self) {
        self.scheduler.wait();
    }

    /// Stops listening and drains in-flight connections.
    pub fn shutdown(self) {
        drop(self.listener);
        self.scheduler.shutdown();
    }

    fn accept_one(&self) -> bool {
        self.dispatch(self.listener.accept())
    }

    fn dispatch(&self, accepted: io::Result<(TcpStream, SocketAddr)>) -> bool {
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                self.scheduler.schedule_request(stream, peer);
                true
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection; backing off");
                thread::sleep(ACCEPT_BACKOFF);
                false
            }
        }
    }
}
