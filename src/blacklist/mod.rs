//! Host blacklist: regular expressions naming origins the proxy refuses.
//!
//! The blacklist file holds one pattern per line. Each pattern must match the
//! *whole* host name for the host to be refused, so `(.*)\.example\.com`
//! blocks `a.example.com` but not `example.org`.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Errors produced while loading a blacklist.
#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("blocked domains file {path:?} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern on line {line}: {source}")]
    Pattern {
        line: usize,
        #[source]
        source: regex::Error,
    },
}

/// A compiled set of blocked-host patterns.
///
/// # Examples
///
/// ```
/// use rttp_proxy::blacklist::Blacklist;
///
/// let blacklist = Blacklist::from_patterns([r"(.*)\.example\.com"]).unwrap();
/// assert!(!blacklist.server_is_allowed("a.example.com"));
/// assert!(blacklist.server_is_allowed("example.org"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    blocked: Vec<Regex>,
}

impl Blacklist {
    /// Loads patterns from `path`, one per line. Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// - [`BlacklistError::Io`] if the file cannot be read.
    /// - [`BlacklistError::Pattern`] if a line is not a valid regular expression.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BlacklistError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| BlacklistError::Io {
            path: path.to_owned(),
            source,
        })?;
        let blacklist = Self::from_patterns(contents.lines())?;
        debug!(path = %path.display(), patterns = blacklist.len(), "blacklist loaded");
        Ok(blacklist)
    }

    /// Compiles an in-memory list of patterns. Blank entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BlacklistError::Pattern`] with the 1-based position of the
    /// first invalid pattern.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, BlacklistError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blocked = Vec::new();
        for (index, pattern) in patterns.into_iter().enumerate() {
            let pattern = pattern.as_ref().trim_end_matches('\r');
            if pattern.trim().is_empty() {
                continue;
            }
            let anchored = format!("^(?:{pattern})$");
            let regex = Regex::new(&anchored).map_err(|source| BlacklistError::Pattern {
                line: index + 1,
                source,
            })?;
            blocked.push(regex);
        }
        Ok(Self { blocked })
    }

    /// Returns `false` if any pattern matches the entire `server` name.
    pub fn server_is_allowed(&self, server: &str) -> bool {
        !self.blocked.iter().any(|re| re.is_match(server))
    }

    /// Returns the number of compiled patterns.
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    /// Returns `true` if no host is blocked.
    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pattern_must_match_whole_host() {
        let bl = Blacklist::from_patterns([r"(.*)\.example\.com"]).unwrap();
        assert!(!bl.server_is_allowed("a.example.com"));
        assert!(bl.server_is_allowed("example.org"));
        assert!(bl.server_is_allowed("a.example.com.evil.net"));
        assert!(bl.server_is_allowed("example.com"));
    }

    #[test]
    fn alternation_is_anchored_as_a_whole() {
        let bl = Blacklist::from_patterns(["foo|bar"]).unwrap();
        assert!(!bl.server_is_allowed("foo"));
        assert!(!bl.server_is_allowed("bar"));
        assert!(bl.server_is_allowed("foobar"));
    }

    #[test]
    fn empty_blacklist_allows_everything() {
        let bl = Blacklist::from_patterns(Vec::<String>::new()).unwrap();
        assert!(bl.is_empty());
        assert!(bl.server_is_allowed("anything.at.all"));
    }

    #[test]
    fn loads_file_and_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(.*)facebook\\.com\r\n\n  \nads\\..*").unwrap();

        let bl = Blacklist::load(file.path()).unwrap();
        assert_eq!(bl.len(), 2);
        assert!(!bl.server_is_allowed("www.facebook.com"));
        assert!(!bl.server_is_allowed("ads.tracker.net"));
        assert!(bl.server_is_allowed("news.ycombinator.com"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Blacklist::load("/definitely/not/here/blocked-domains.txt").unwrap_err();
        assert!(matches!(err, BlacklistError::Io { .. }));
    }

    #[test]
    fn invalid_pattern_reports_line() {
        let err = Blacklist::from_patterns(["ok", "", "(unclosed"]).unwrap_err();
        assert!(matches!(err, BlacklistError::Pattern { line: 3, .. }));
    }
}
