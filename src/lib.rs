//! # rttp-proxy
//!
//! A caching HTTP/1.1 forwarding proxy on blocking OS threads.
//!
//! ```text
//!  client ──▶ server (accept) ──▶ scheduler ──▶ pool ──▶ handler ──▶ origin
//!                                                          │
//!                                                   blacklist, cache
//! ```
//!
//! The listener accepts and nothing else. Each connection becomes one task
//! on a fixed-size [`pool::ThreadPool`], so the worker count bounds how many
//! connections are serviced at once. Cacheable `GET` responses are kept in a
//! disk-backed [`cache::ResponseCache`] with per-key locking.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_proxy::{Blacklist, CacheConfig, HandlerConfig, ProxyServer, RequestHandler,
//!                  ResponseCache, Scheduler, ThreadPool};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = ResponseCache::open("/tmp/proxy-cache", CacheConfig::default())?;
//!     let blacklist = Blacklist::from_patterns([r"(.*)\.doubleclick\.net"])?;
//!     let handler = RequestHandler::new(Arc::new(blacklist), Arc::new(cache), HandlerConfig::default());
//!     let scheduler = Scheduler::new(ThreadPool::new(64)?, Arc::new(handler));
//!     ProxyServer::bind_to("127.0.0.1:3128", scheduler)?.run();
//!     Ok(())
//! }
//! ```

// ── Proxy core ────────────────────────────────────────────────────────────────
pub mod cache;
pub mod handler;
pub mod pool;
pub mod scheduler;
pub mod server;

// ── Supporting layers ─────────────────────────────────────────────────────────
pub mod blacklist;
pub mod config;
pub mod http;
pub mod sync;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use blacklist::{Blacklist, BlacklistError};
pub use cache::{CacheConfig, CacheError, CacheKey, ResponseCache};
pub use config::{Cli, ConfigError, ProxyConfig};
pub use handler::{HandlerConfig, RequestHandler};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use pool::{PoolError, ThreadPool};
pub use scheduler::Scheduler;
pub use server::{ProxyServer, ServerError};
