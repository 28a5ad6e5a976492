//! Command line of the `lazyfs` binary

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use common::config::MountConfig;

use crate::error::DaemonError;

/// Mount a lazily populated, read-only view of a cache directory
#[derive(Parser, Debug, Clone)]
#[command(name = "lazyfs", version, about)]
pub struct Args {
    /// Where to mount the filesystem
    pub mountpoint: PathBuf,

    /// Cache directory backing the mount
    #[arg(long, env = "LAZYFS_CACHE")]
    pub cache: Option<PathBuf>,

    /// TOML mount configuration; flags given on the command line win
    #[arg(long, env = "LAZYFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Fail requests the helper has not completed after this many seconds
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Re-request cached files whose size or mtime disagree with their index
    #[arg(long)]
    pub revalidate: bool,

    /// Run a built-in helper that answers requests from this directory
    #[arg(long)]
    pub mirror: Option<PathBuf>,

    /// Virtual directories the built-in helper publishes as dynamic
    #[arg(long = "dynamic", requires = "mirror")]
    pub dynamic: Vec<String>,

    /// Also write daily rotated logs to this directory
    #[arg(long, env = "LAZYFS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Kernel attribute cache timeout in seconds
    #[arg(long, default_value_t = 1)]
    pub attr_ttl_secs: u64,
}

impl Args {
    /// Build the mount configuration from the config file and flags
    pub fn mount_config(&self) -> Result<MountConfig, DaemonError> {
        let mut config = match (&self.config, &self.cache) {
            (Some(file), _) => MountConfig::from_file(file)?,
            (None, Some(cache)) => MountConfig::new(cache),
            (None, None) => return Err(DaemonError::MissingCacheRoot),
        };

        if let Some(cache) = &self.cache {
            config.cache_root = cache.clone();
        }
        if let Some(secs) = self.request_timeout {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if self.revalidate {
            config = config.with_revalidation(true);
        }
        Ok(config)
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("lazyfs").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cache_flag() {
        let args = parse(&["/mnt", "--cache", "/var/cache/lazy"]);
        let config = args.mount_config().unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/var/cache/lazy"));
        assert_eq!(config.request_timeout(), None);
        assert!(!config.revalidate_files);
        assert_eq!(args.attr_ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_cache_root() {
        let args = parse(&["/mnt"]);
        if args.cache.is_none() && args.config.is_none() {
            assert!(matches!(
                args.mount_config(),
                Err(DaemonError::MissingCacheRoot)
            ));
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cache_root = \"/from/file\"\nrequest_timeout_secs = 30\nrevalidate_files = false"
        )
        .unwrap();
        let config_path = file.path().to_str().unwrap();

        let config = parse(&["/mnt", "--config", config_path])
            .mount_config()
            .unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/from/file"));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));

        let config = parse(&[
            "/mnt",
            "--config",
            config_path,
            "--cache",
            "/from/flag",
            "--request-timeout",
            "5",
            "--revalidate",
        ])
        .mount_config()
        .unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/from/flag"));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(5)));
        assert!(config.revalidate_files);
    }

    #[test]
    fn test_dynamic_requires_mirror() {
        assert!(Args::try_parse_from(["lazyfs", "/mnt", "--dynamic", "/dyn"]).is_err());
        let args = parse(&["/mnt", "--mirror", "/srv/origin", "--dynamic", "/dyn"]);
        assert_eq!(args.dynamic, vec!["/dyn".to_string()]);
    }
}
