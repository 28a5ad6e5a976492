//! Errors of the lazyfs daemon

use std::path::PathBuf;

use common::error::LazyFsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Neither `--cache` nor a config file named a cache root
    #[error("no cache root given: pass --cache or a config file with cache_root")]
    MissingCacheRoot,

    #[error(transparent)]
    Core(#[from] LazyFsError),

    #[error("failed to mount at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up logging: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("runtime error: {0}")]
    Runtime(String),
}
