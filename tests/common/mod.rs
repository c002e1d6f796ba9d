//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use rttp_proxy::{
    Blacklist, CacheConfig, HandlerConfig, ProxyServer, RequestHandler, ResponseCache, Scheduler,
    ThreadPool,
};

/// A loopback origin that answers every request with a fixed response and
/// remembers what it was sent.
pub struct Origin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    last_request: Arc<Mutex<String>>,
}

impl Origin {
    /// Number of connections the origin has answered.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// The head of the most recent request, as received.
    pub fn last_request(&self) -> String {
        self.last_request.lock().clone()
    }
}

/// Starts an origin that replies with `response` to every connection.
pub fn start_origin(response: &'static str) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let last_request = Arc::new(Mutex::new(String::new()));

    let (h, l) = (Arc::clone(&hits), Arc::clone(&last_request));
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let head = read_head(&mut stream);
            *l.lock() = head;
            h.fetch_add(1, Ordering::SeqCst);
            let _ = stream.write_all(response.as_bytes());
        }
    });

    Origin {
        addr,
        hits,
        last_request,
    }
}

fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Starts a proxy on a loopback port with the given blacklist patterns.
///
/// The returned directory holds the cache and must outlive the test.
pub fn start_proxy(blocked: &[&str]) -> (SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResponseCache::open(dir.path(), CacheConfig::default()).unwrap();
    let blacklist = Blacklist::from_patterns(blocked.iter().copied()).unwrap();
    let handler = RequestHandler::new(Arc::new(blacklist), Arc::new(cache), HandlerConfig::default());
    let scheduler = Scheduler::new(ThreadPool::new(4).unwrap(), Arc::new(handler));
    let server = ProxyServer::bind_to("127.0.0.1:0", scheduler).unwrap();
    let addr = server.local_addr();
    thread::spawn(move || server.run());
    (addr, dir)
}

/// Sends `raw` to the proxy and returns the complete reply.
pub fn send(proxy: SocketAddr, raw: &str) -> String {
    let mut client = TcpStream::connect(proxy).unwrap();
    client.write_all(raw.as_bytes()).unwrap();
    let mut reply = String::new();
    client.read_to_string(&mut reply).unwrap();
    reply
}

/// Number of committed entries in a cache directory.
pub fn entry_count(dir: &tempfile::TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".entry"))
        .count()
}
