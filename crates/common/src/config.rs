//! Mount configuration
//!
//! A mount is described by a [`MountConfig`], which can be built in code or
//! loaded from a TOML file:
//!
//! ```toml
//! cache_root = "/var/cache/lazyfs"
//! request_timeout_secs = 30
//! revalidate_files = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default upper bound on the size of a single directory index (100 KiB)
pub const DEFAULT_MAX_INDEX_BYTES: u64 = 100 * 1024;

/// Default number of decoded indices kept in memory
pub const DEFAULT_INDEX_CACHE_CAPACITY: u64 = 4096;

/// Configuration for a single mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Backing directory holding fetched content and directory indices.
    /// Must exist and be owned by the mounting user.
    pub cache_root: PathBuf,
    /// Fail a request's waiters if the helper has not completed it within
    /// this many seconds. `None` waits forever.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Treat a cached body whose size or mtime disagrees with its index
    /// entry as stale and ask the helper for it again
    #[serde(default)]
    pub revalidate_files: bool,
    /// Indices larger than this are rejected as invalid
    #[serde(default = "default_max_index_bytes")]
    pub max_index_bytes: u64,
    /// Maximum number of decoded indices kept in memory
    #[serde(default = "default_index_cache_capacity")]
    pub index_cache_capacity: u64,
}

fn default_max_index_bytes() -> u64 {
    DEFAULT_MAX_INDEX_BYTES
}

fn default_index_cache_capacity() -> u64 {
    DEFAULT_INDEX_CACHE_CAPACITY
}

impl MountConfig {
    /// Create a config with defaults for everything but the cache root
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            request_timeout_secs: None,
            revalidate_files: false,
            max_index_bytes: DEFAULT_MAX_INDEX_BYTES,
            index_cache_capacity: DEFAULT_INDEX_CACHE_CAPACITY,
        }
    }

    /// Load a config from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_revalidation(mut self, revalidate: bool) -> Self {
        self.revalidate_files = revalidate;
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MountConfig::new("/tmp/cache");
        assert_eq!(config.cache_root, PathBuf::from("/tmp/cache"));
        assert_eq!(config.request_timeout(), None);
        assert!(!config.revalidate_files);
        assert_eq!(config.max_index_bytes, DEFAULT_MAX_INDEX_BYTES);
    }

    #[test]
    fn test_from_toml() {
        let config = MountConfig::from_toml(
            r#"
            cache_root = "/var/cache/lazyfs"
            request_timeout_secs = 30
            revalidate_files = true
            "#,
        )
        .unwrap();

        assert_eq!(config.cache_root, PathBuf::from("/var/cache/lazyfs"));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert!(config.revalidate_files);
        assert_eq!(config.index_cache_capacity, DEFAULT_INDEX_CACHE_CAPACITY);
    }

    #[test]
    fn test_from_toml_missing_root() {
        assert!(MountConfig::from_toml("revalidate_files = true").is_err());
    }

    #[test]
    fn test_timeout_rounds_up_to_one_second() {
        let config = MountConfig::new("/c").with_request_timeout(Duration::from_millis(10));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(1)));
    }
}
