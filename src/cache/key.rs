//! Content-addressed cache keys.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::http::Request;

/// A fixed-width key derived from a request's identity.
///
/// The identity is `"{METHOD} {absolute-url}"`; request headers are not part
/// of it. The key is the lowercase hex SHA-256 of that string.
///
/// # Examples
///
/// ```
/// use rttp_proxy::cache::CacheKey;
/// use rttp_proxy::http::Request;
///
/// let raw = b"GET http://example.com/ HTTP/1.1\r\n\r\n";
/// let request = Request::read_from(&mut &raw[..], 1024).unwrap();
///
/// assert_eq!(CacheKey::identity(&request), "GET http://example.com:80/");
/// assert_eq!(CacheKey::for_request(&request).as_str().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hashes the identity of `request`.
    pub fn for_request(request: &Request) -> Self {
        Self::from_identity(&Self::identity(request))
    }

    /// Returns the canonical identity string the key is hashed from.
    pub fn identity(request: &Request) -> String {
        format!("{} {}", request.method(), request.url())
    }

    fn from_identity(identity: &str) -> Self {
        let digest = Sha256::digest(identity.as_bytes());
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::read_from(&mut raw.as_bytes(), 4096).unwrap()
    }

    #[test]
    fn key_is_deterministic_hex() {
        let a = CacheKey::for_request(&request("GET http://h/x HTTP/1.1\r\n\r\n"));
        let b = CacheKey::for_request(&request("GET http://h/x HTTP/1.1\r\n\r\n"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn client_headers_do_not_change_the_key() {
        let a = request("GET http://h/x HTTP/1.1\r\nX-Forwarded-For: 1.1.1.1\r\n\r\n");
        let b = request("GET http://h/x HTTP/1.1\r\nUser-Agent: curl\r\n\r\n");
        assert_eq!(CacheKey::for_request(&a), CacheKey::for_request(&b));
    }

    #[test]
    fn equivalent_targets_share_a_key() {
        let absolute = request("GET http://H:80/x HTTP/1.1\r\n\r\n");
        let origin_form = request("GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(
            CacheKey::for_request(&absolute),
            CacheKey::for_request(&origin_form)
        );
    }

    #[test]
    fn method_and_url_distinguish_keys() {
        let get = request("GET http://h/x HTTP/1.1\r\n\r\n");
        let head = request("HEAD http://h/x HTTP/1.1\r\n\r\n");
        let other = request("GET http://h/y HTTP/1.1\r\n\r\n");
        assert_ne!(CacheKey::for_request(&get), CacheKey::for_request(&head));
        assert_ne!(CacheKey::for_request(&get), CacheKey::for_request(&other));
    }
}
