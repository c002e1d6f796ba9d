//! Hands accepted connections to the worker pool.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use tracing::trace;

use crate::handler::RequestHandler;
use crate::pool::ThreadPool;

/// Glue between the listener and the pool: one pool task per connection.
#[derive(Debug)]
pub struct Scheduler {
    pool: ThreadPool,
    handler: Arc<RequestHandler>,
}

impl Scheduler {
    pub fn new(pool: ThreadPool, handler: Arc<RequestHandler>) -> Self {
        Self { pool, handler }
    }

    /// Queues `stream` for servicing and returns immediately.
    ///
    /// Ownership of the connection moves into the task; the handler closes it.
    pub fn schedule_request(&self, stream: TcpStream, peer: SocketAddr) {
        trace!(%peer, queued = self.pool.outstanding(), "scheduling connection");
        let handler = Arc::clone(&self.handler);
        self.pool
            .schedule(move || handler.service_request(stream, peer));
    }

    /// Blocks until every scheduled connection has been serviced.
    pub fn wait(&self) {
        self.pool.wait();
    }

    /// Returns the number of connections scheduled but not yet finished.
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    /// Finishes every scheduled connection, then stops the pool's threads.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Blacklist;
    use crate::cache::{CacheConfig, ResponseCache};
    use crate::handler::HandlerConfig;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn scheduler(workers: usize, dir: &tempfile::TempDir) -> Scheduler {
        let cache = ResponseCache::open(dir.path(), CacheConfig::default()).unwrap();
        let blacklist = Blacklist::from_patterns(["blocked"]).unwrap();
        let handler = RequestHandler::new(
            Arc::new(blacklist),
            Arc::new(cache),
            HandlerConfig::default(),
        );
        Scheduler::new(ThreadPool::new(workers).unwrap(), Arc::new(handler))
    }

    #[test]
    fn every_connection_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(2, &dir);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let clients: Vec<_> = (0..5)
            .map(|_| {
                let mut c = std::net::TcpStream::connect(addr).unwrap();
                c.write_all(b"GET http://blocked/ HTTP/1.1\r\n\r\n").unwrap();
                c
            })
            .collect();

        for _ in 0..clients.len() {
            let (stream, peer) = listener.accept().unwrap();
            scheduler.schedule_request(stream, peer);
        }
        scheduler.wait();
        assert_eq!(scheduler.outstanding(), 0);

        for mut c in clients {
            let mut reply = String::new();
            c.read_to_string(&mut reply).unwrap();
            assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{reply}");
        }
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_finishes_queued_connections() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(1, &dir);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"garbage\r\n\r\n").unwrap();
        let (stream, peer) = listener.accept().unwrap();
        scheduler.schedule_request(stream, peer);
        scheduler.shutdown();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
    }
}
