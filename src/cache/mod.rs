//! Disk-backed HTTP response cache.
//!
//! Entries are addressed by a [`CacheKey`] (a hash of the request identity)
//! and live at `<root>/<key>.entry`, one record per key (see [`entry`] for
//! the format). Each record states its own absolute expiry, so staleness is
//! a field of the entry and not part of its name.
//!
//! # Concurrency
//!
//! Every key has its own mutex, created on first use and kept in a
//! concurrent map. The mutex is held across the whole read-check-delete
//! sequence in [`ResponseCache::lookup`] and the whole write sequence in
//! [`ResponseCache::store`]. Writes go to a temporary file that is synced and
//! then renamed over the entry, so no reader can observe a partial record.
//! Origin I/O never happens under a cache lock: two workers can fetch the
//! same uncached URL at once, and the later `store` simply wins.

mod entry;
mod key;

pub use key::CacheKey;

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::http::{Request, Response};
use entry::EntryHeader;

/// Name of the cache directory created under the user's home directory.
pub const DEFAULT_CACHE_SUBDIR: &str = ".http-proxy-cache";

/// Responses that cannot live at least this long are not worth a disk round-trip.
pub const DEFAULT_MIN_TTL_SECS: u64 = 100;

const ENTRY_EXTENSION: &str = "entry";
const TEMP_EXTENSION: &str = "entry.tmp";

/// Errors produced by cache maintenance and writes.
///
/// Lookups never fail: every problem on the read path is reported as a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write cache entry {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove cache entry {path:?}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cache entry header: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Tunables for [`ResponseCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Minimum freshness lifetime, in seconds, for a response to be cached.
    pub min_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_ttl: DEFAULT_MIN_TTL_SECS,
        }
    }
}

/// A content-addressed, TTL-expiring response store shared by all workers.
///
/// # Examples
///
/// ```no_run
/// use rttp_proxy::cache::{CacheConfig, ResponseCache};
/// use rttp_proxy::http::{Request, Response};
///
/// # fn demo(request: &Request, response: &Response) -> Result<(), Box<dyn std::error::Error>> {
/// let cache = ResponseCache::open("/tmp/proxy-cache", CacheConfig::default())?;
/// if cache.should_cache(request, response) {
///     cache.store(request, response)?;
/// }
/// assert!(cache.lookup(request).is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ResponseCache {
    root: PathBuf,
    config: CacheConfig,
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl ResponseCache {
    /// Opens (creating if necessary) a cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CreateDir`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, config: CacheConfig) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CacheError::CreateDir {
            path: root.clone(),
            source,
        })?;
        debug!(root = %root.display(), min_ttl = config.min_ttl, "response cache opened");
        Ok(Self {
            root,
            config,
            locks: DashMap::new(),
        })
    }

    /// Returns the cache's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns `true` if `response` to `request` is worth storing.
    ///
    /// Requires a `GET`, a `200`, the origin's permission to cache, and a
    /// lifetime of at least [`CacheConfig::min_ttl`] seconds.
    pub fn should_cache(&self, request: &Request, response: &Response) -> bool {
        request.method().is_cacheable()
            && response.status() == 200
            && response.permits_caching()
            && response.ttl() >= self.config.min_ttl
    }

    /// Returns the fresh cached response for `request`, if any.
    ///
    /// Expired entries are deleted on the way. Unreadable or corrupt entries
    /// are deleted and reported as a miss, so the caller falls through to the
    /// origin server.
    pub fn lookup(&self, request: &Request) -> Option<Response> {
        if !request.method().is_cacheable() {
            return None;
        }

        let identity = CacheKey::identity(request);
        let key = CacheKey::for_request(request);
        let path = self.entry_path(&key);

        let lock = self.lock_for(&key);
        let _guard = lock.lock();

        let record = match fs::read(&path) {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(url = %request.url(), %key, error = %e, "cache entry unreadable; treating as miss");
                return None;
            }
        };

        let (header, wire) = match entry::decode(&record) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(url = %request.url(), %key, error = %e, "corrupt cache entry; forwarding to origin");
                self.discard(&path);
                self.retire_lock(&key, &lock);
                return None;
            }
        };

        if header.identity != identity {
            debug!(url = %request.url(), %key, stored = %header.identity, "cache key collision; treating as miss");
            return None;
        }

        if header.is_expired(now_secs()) {
            debug!(url = %request.url(), %key, "cache entry expired");
            self.discard(&path);
            self.retire_lock(&key, &lock);
            return None;
        }

        match Response::parse(wire) {
            Ok(response) => {
                info!(url = %request.url(), %key, "using cached copy of previous request");
                Some(response)
            }
            Err(e) => {
                warn!(url = %request.url(), %key, error = %e, "problem rehydrating cached response; forwarding to origin");
                self.discard(&path);
                self.retire_lock(&key, &lock);
                None
            }
        }
    }

    /// Stores `response` under `request`'s key, replacing any previous entry.
    ///
    /// The entry expires `response.ttl()` seconds from now; a zero TTL writes
    /// an entry that is already stale, which effectively invalidates the key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Write`] if the record cannot be written, synced,
    /// or moved into place. A failed store leaves any previous entry intact.
    pub fn store(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        let key = CacheKey::for_request(request);
        let path = self.entry_path(&key);
        let temp = self.root.join(format!("{key}.{TEMP_EXTENSION}"));

        let now = now_secs();
        let ttl = response.ttl();
        let header = EntryHeader {
            key: key.to_string(),
            identity: CacheKey::identity(request),
            created_at: now,
            expires_at: now.saturating_add(ttl),
        };
        let record = entry::encode(&header, &response.to_bytes())?;

        let lock = self.lock_for(&key);
        let _guard = lock.lock();

        let written = write_synced(&temp, &record).and_then(|()| fs::rename(&temp, &path));
        if let Err(source) = written {
            let _ = fs::remove_file(&temp);
            return Err(CacheError::Write { path, source });
        }

        info!(url = %request.url(), %key, ttl, "cached response");
        Ok(())
    }

    /// Removes the entry for `request`. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Remove`] if the file exists but cannot be deleted.
    pub fn remove(&self, request: &Request) -> Result<bool, CacheError> {
        let key = CacheKey::for_request(request);
        let path = self.entry_path(&key);
        let lock = self.lock_for(&key);
        let _guard = lock.lock();

        match fs::remove_file(&path) {
            Ok(()) => {
                self.retire_lock(&key, &lock);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Remove { path, source }),
        }
    }

    /// Deletes every entry and leftover temporary file under the root.
    ///
    /// Not synchronized with in-flight stores; meant for maintenance while
    /// the proxy is idle.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Remove`] on the first file that cannot be deleted.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let listing = fs::read_dir(&self.root).map_err(|source| CacheError::Remove {
            path: self.root.clone(),
            source,
        })?;

        let mut removed = 0;
        for dir_entry in listing.flatten() {
            let path = dir_entry.path();
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            let ours = name.ends_with(&format!(".{ENTRY_EXTENSION}"))
                || name.ends_with(&format!(".{TEMP_EXTENSION}"));
            if !ours {
                continue;
            }
            fs::remove_file(&path).map_err(|source| CacheError::Remove {
                path: path.clone(),
                source,
            })?;
            removed += 1;
        }
        self.locks.clear();
        info!(removed, "cache cleared");
        Ok(removed)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    /// Returns the lock handle for `key`, creating it on first use.
    fn lock_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(key.clone()).or_default())
    }

    /// Drops `key`'s lock from the table once its entry is gone, provided no
    /// other thread holds a handle. Must be called with `handle` still locked.
    fn retire_lock(&self, key: &CacheKey, handle: &Arc<Mutex<()>>) {
        self.locks
            .remove_if(key, |_, lock| Arc::ptr_eq(lock, handle) && Arc::strong_count(lock) == 2);
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to delete stale cache entry");
            }
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.len()
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use std::thread;
    use std::time::Duration;

    fn request(raw: &str) -> Request {
        Request::read_from(&mut raw.as_bytes(), 4096).unwrap()
    }

    fn get(url: &str) -> Request {
        request(&format!("GET {url} HTTP/1.1\r\n\r\n"))
    }

    fn cacheable(ttl: u64, payload: &str) -> Response {
        Response::new(StatusCode::Ok)
            .header("Cache-Control", format!("public, max-age={ttl}"))
            .body(payload.to_owned())
    }

    fn open() -> (tempfile::TempDir, ResponseCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path().join("cache"), CacheConfig::default()).unwrap();
        (dir, cache)
    }

    // ── should_cache ──────────────────────────────────────────────────────────

    #[test]
    fn should_cache_accepts_long_lived_ok_get() {
        let (_dir, cache) = open();
        assert!(cache.should_cache(&get("http://h/"), &cacheable(150, "x")));
    }

    #[test]
    fn should_cache_rejects_short_ttl() {
        let (_dir, cache) = open();
        assert!(!cache.should_cache(&get("http://h/"), &cacheable(50, "x")));
        assert!(cache.should_cache(&get("http://h/"), &cacheable(100, "x")));
    }

    #[test]
    fn should_cache_rejects_non_200() {
        let (_dir, cache) = open();
        let raw = b"HTTP/1.1 404 Not Found\r\nCache-Control: max-age=500\r\nContent-Length: 0\r\n\r\n";
        let not_found = Response::parse(raw).unwrap();
        assert!(not_found.permits_caching());
        assert!(!cache.should_cache(&get("http://h/"), &not_found));
    }

    #[test]
    fn should_cache_rejects_uncacheable_directive() {
        let (_dir, cache) = open();
        let private = Response::new(StatusCode::Ok).header("Cache-Control", "private, max-age=500");
        assert!(!cache.should_cache(&get("http://h/"), &private));
    }

    #[test]
    fn should_cache_rejects_non_get() {
        let (_dir, cache) = open();
        let post = request("POST http://h/ HTTP/1.1\r\nContent-Length: 0\r\n\r\n");
        assert!(!cache.should_cache(&post, &cacheable(500, "x")));
    }

    #[test]
    fn min_ttl_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), CacheConfig { min_ttl: 10 }).unwrap();
        assert!(cache.should_cache(&get("http://h/"), &cacheable(50, "x")));
    }

    // ── lookup / store ────────────────────────────────────────────────────────

    #[test]
    fn miss_on_empty_cache() {
        let (_dir, cache) = open();
        assert!(cache.lookup(&get("http://h/nothing")).is_none());
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let (_dir, cache) = open();
        let req = get("http://example.com/page");
        let resp = cacheable(300, "<html>cached</html>");

        cache.store(&req, &resp).unwrap();
        let hit = cache.lookup(&req).unwrap();

        assert_eq!(hit, resp);
        assert_eq!(hit.payload().as_ref(), b"<html>cached</html>");
    }

    #[test]
    fn store_overwrites_previous_entry() {
        let (_dir, cache) = open();
        let req = get("http://h/v");
        cache.store(&req, &cacheable(300, "first")).unwrap();
        cache.store(&req, &cacheable(300, "second")).unwrap();

        assert_eq!(cache.lookup(&req).unwrap().payload().as_ref(), b"second");
        let files = fs::read_dir(cache.root()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn non_get_lookup_misses() {
        let (_dir, cache) = open();
        let head = request("HEAD http://h/ HTTP/1.1\r\n\r\n");
        cache.store(&head, &cacheable(300, "x")).unwrap();
        assert!(cache.lookup(&head).is_none());
    }

    #[test]
    fn zero_ttl_entry_is_already_stale() {
        let (_dir, cache) = open();
        let req = get("http://h/z");
        cache.store(&req, &Response::new(StatusCode::Ok).body("z")).unwrap();
        assert!(cache.lookup(&req).is_none());
        assert!(!cache.entry_path(&CacheKey::for_request(&req)).exists());
    }

    #[test]
    fn expired_entry_is_removed() {
        let (_dir, cache) = open();
        let req = get("http://h/short");
        cache.store(&req, &cacheable(1, "brief")).unwrap();
        let path = cache.entry_path(&CacheKey::for_request(&req));
        assert!(path.exists());

        thread::sleep(Duration::from_secs(2));

        assert!(cache.lookup(&req).is_none());
        assert!(!path.exists());
        assert_eq!(cache.tracked_locks(), 0);
    }

    #[test]
    fn corrupt_entry_fails_open() {
        let (_dir, cache) = open();
        let req = get("http://h/corrupt");
        cache.store(&req, &cacheable(300, "good")).unwrap();

        let path = cache.entry_path(&CacheKey::for_request(&req));
        let mut record = fs::read(&path).unwrap();
        record.truncate(record.len() - 2);
        fs::write(&path, &record).unwrap();

        assert!(cache.lookup(&req).is_none());
        assert!(!path.exists());

        cache.store(&req, &cacheable(300, "fresh")).unwrap();
        assert_eq!(cache.lookup(&req).unwrap().payload().as_ref(), b"fresh");
    }

    #[test]
    fn garbage_entry_fails_open() {
        let (_dir, cache) = open();
        let req = get("http://h/garbage");
        fs::write(cache.entry_path(&CacheKey::for_request(&req)), b"\xff\xfe not a record").unwrap();
        assert!(cache.lookup(&req).is_none());
    }

    #[test]
    fn garbage_entry_releases_its_lock() {
        let (_dir, cache) = open();
        let req = get("http://h/garbage-lock");
        fs::write(cache.entry_path(&CacheKey::for_request(&req)), b"no header line").unwrap();
        assert!(cache.lookup(&req).is_none());
        assert_eq!(cache.tracked_locks(), 0);
    }

    /// Writes a record for `req`'s key with a caller-chosen identity and body.
    fn plant(cache: &ResponseCache, req: &Request, identity: &str, wire: &[u8]) -> PathBuf {
        let key = CacheKey::for_request(req);
        let now = now_secs();
        let header = EntryHeader {
            key: key.to_string(),
            identity: identity.to_owned(),
            created_at: now,
            expires_at: now + 600,
        };
        let path = cache.entry_path(&key);
        fs::write(&path, entry::encode(&header, wire).unwrap()).unwrap();
        path
    }

    #[test]
    fn unrepresentable_content_length_fails_open() {
        let (_dir, cache) = open();
        let req = get("http://h/huge");
        let path = plant(
            &cache,
            &req,
            &CacheKey::identity(&req),
            b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nab",
        );

        assert!(cache.lookup(&req).is_none());
        assert!(!path.exists());
        assert_eq!(cache.tracked_locks(), 0);
    }

    #[test]
    fn identity_mismatch_is_a_miss() {
        let (_dir, cache) = open();
        let req = get("http://h/mine");
        let wire = cacheable(300, "someone else's").to_bytes();
        let path = plant(&cache, &req, "GET http://other:80/theirs", &wire);

        assert!(cache.lookup(&req).is_none());
        assert!(path.exists(), "an entry for another identity must be left alone");
    }

    #[test]
    fn remove_and_clear() {
        let (_dir, cache) = open();
        let a = get("http://h/a");
        let b = get("http://h/b");
        cache.store(&a, &cacheable(300, "a")).unwrap();
        cache.store(&b, &cacheable(300, "b")).unwrap();
        fs::write(cache.root().join("unrelated.txt"), b"keep me").unwrap();

        assert!(cache.remove(&a).unwrap());
        assert!(!cache.remove(&a).unwrap());
        assert!(cache.lookup(&a).is_none());

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.lookup(&b).is_none());
        assert!(cache.root().join("unrelated.txt").exists());
    }

    #[test]
    fn readers_never_observe_partial_writes() {
        let (_dir, cache) = open();
        let cache = Arc::new(cache);
        let req = Arc::new(get("http://h/contended"));
        const PAYLOAD_LEN: usize = 512 * 1024;

        let writers: Vec<_> = (0..4u8)
            .map(|w| {
                let cache = Arc::clone(&cache);
                let req = Arc::clone(&req);
                thread::spawn(move || {
                    let fill = char::from(b'a' + w).to_string().repeat(PAYLOAD_LEN);
                    for _ in 0..5 {
                        cache.store(&req, &cacheable(300, &fill)).unwrap();
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let req = Arc::clone(&req);
                thread::spawn(move || {
                    for _ in 0..40 {
                        if let Some(hit) = cache.lookup(&req) {
                            let payload = hit.payload();
                            assert_eq!(payload.len(), PAYLOAD_LEN);
                            let first = payload[0];
                            assert!(payload.iter().all(|&b| b == first), "mixed payload");
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert!(cache.lookup(&req).is_some());
    }
}
