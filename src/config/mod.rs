//! Startup configuration: command line, environment, and defaults.
//!
//! The command line only carries `--port`. Everything else comes from the
//! environment:
//!
//! | Variable                | Default                        |
//! |-------------------------|--------------------------------|
//! | `HTTP_PROXY_CACHE_DIR`  | `$HOME/.http-proxy-cache`      |
//! | `HTTP_PROXY_BLACKLIST`  | `blocked-domains.txt`          |
//! | `HTTP_PROXY_WORKERS`    | `64`                           |
//!
//! Log filtering is controlled separately through `RUST_LOG`.

use std::path::PathBuf;

use clap::Parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{CacheConfig, DEFAULT_CACHE_SUBDIR};
use crate::handler::HandlerConfig;

pub const CACHE_DIR_VAR: &str = "HTTP_PROXY_CACHE_DIR";
pub const BLACKLIST_VAR: &str = "HTTP_PROXY_BLACKLIST";
pub const WORKERS_VAR: &str = "HTTP_PROXY_WORKERS";

pub const DEFAULT_BLACKLIST_FILE: &str = "blocked-domains.txt";
pub const DEFAULT_WORKERS: usize = 64;

/// Lowest port handed out as a per-user default; below it lie the
/// privileged ports.
const FIRST_UNPRIVILEGED_PORT: u16 = 1024;

/// Errors produced while assembling a [`ProxyConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidWorkers { var: &'static str, value: String },

    #[error("no home directory found; set {CACHE_DIR_VAR} to choose a cache directory")]
    NoCacheDir,
}

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "http-proxy", version, about = "A caching HTTP/1.1 forwarding proxy")]
pub struct Cli {
    /// Port to listen on. Defaults to a value derived from the current user.
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,
}

/// Everything the binary needs to start a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub port: u16,
    pub workers: usize,
    pub cache_dir: PathBuf,
    pub blacklist_path: PathBuf,
    pub cache: CacheConfig,
    pub handler: HandlerConfig,
}

impl ProxyConfig {
    /// Builds the configuration from `cli` and the process environment.
    ///
    /// # Errors
    ///
    /// See [`ProxyConfig::from_sources`].
    pub fn from_env(cli: &Cli) -> Result<Self, ConfigError> {
        Self::from_sources(cli, |name| std::env::var(name).ok(), dirs::home_dir())
    }

    /// Builds the configuration from explicit sources.
    ///
    /// `env` looks up an environment variable and `home` is the user's home
    /// directory, if one is known. Empty variables count as unset.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidWorkers`] if the worker count is not a positive integer.
    /// - [`ConfigError::NoCacheDir`] if neither a cache directory nor a home
    ///   directory is available.
    pub fn from_sources<F>(cli: &Cli, env: F, home: Option<PathBuf>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        let port = match cli.port {
            Some(port) => port,
            None => default_port_for(&env("USER").unwrap_or_default()),
        };

        let workers = match env(WORKERS_VAR) {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidWorkers {
                        var: WORKERS_VAR,
                        value,
                    });
                }
            },
            None => DEFAULT_WORKERS,
        };

        let cache_dir = match env(CACHE_DIR_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => home.ok_or(ConfigError::NoCacheDir)?.join(DEFAULT_CACHE_SUBDIR),
        };

        let blacklist_path = env(BLACKLIST_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BLACKLIST_FILE));

        Ok(Self {
            port,
            workers,
            cache_dir,
            blacklist_path,
            cache: CacheConfig::default(),
            handler: HandlerConfig::default(),
        })
    }
}

/// Maps a user name onto a stable port in `1024..=65535`.
///
/// Different users on a shared machine get different defaults with high
/// probability, and the same user always gets the same port.
///
/// # Examples
///
/// ```
/// use rttp_proxy::config::default_port_for;
///
/// let port = default_port_for("alice");
/// assert!(port >= 1024);
/// assert_eq!(port, default_port_for("alice"));
/// ```
pub fn default_port_for(user: &str) -> u16 {
    let digest = Sha256::digest(user.as_bytes());
    let seed = u16::from_be_bytes([digest[0], digest[1]]);
    let span = u16::MAX - FIRST_UNPRIVILEGED_PORT + 1;
    FIRST_UNPRIVILEGED_PORT + seed % span
}
