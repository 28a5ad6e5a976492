//! The mount context
//!
//! A [`Mount`] owns everything one mounted tree needs: its configuration,
//! the cache store, the broker and the resolver (with its identity table).
//! There is no process-wide state; two mounts in one process are fully
//! independent.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::broker::{Broker, BrokerStatus, ControlChannel};
use crate::config::MountConfig;
use crate::error::Result;
use crate::identity::NodeId;
use crate::resolver::{DirEntry, Node, NodeAttr, OpenFile, Resolver};
use crate::store::{CacheStore, IndexCacheStats};

/// Snapshot of a mount for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountStatus {
    pub broker: BrokerStatus,
    pub index_cache: IndexCacheStats,
    /// Identities assigned so far, root included
    pub identities: usize,
}

#[derive(Debug)]
pub struct Mount {
    config: MountConfig,
    broker: Arc<Broker>,
    resolver: Resolver,
}

impl Mount {
    /// Create a mount over an existing cache root.
    ///
    /// Fails with a configuration error if the cache root is missing, not a
    /// directory or not owned by the current user.
    pub fn new(config: MountConfig) -> Result<Self> {
        let store = CacheStore::open(&config)?;
        let broker = Arc::new(Broker::new(config.request_timeout()));
        let resolver = Resolver::new(store, broker.clone(), config.revalidate_files);

        info!(
            cache_root = %resolver.store().root().display(),
            timeout = ?config.request_timeout(),
            revalidate = config.revalidate_files,
            "mount opened"
        );
        Ok(Self {
            config,
            broker,
            resolver,
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        self.resolver.store()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Attach as the helper. Only one control channel may be open at a time.
    pub fn open_control(&self) -> Result<ControlChannel> {
        self.broker.attach()
    }

    pub fn lookup(&self, vpath: &str) -> Result<Node> {
        self.resolver.lookup(vpath)
    }

    pub fn stat(&self, vpath: &str) -> Result<NodeAttr> {
        self.resolver.stat(vpath)
    }

    pub fn read_dir(&self, vpath: &str) -> Result<Vec<DirEntry>> {
        self.resolver.read_dir(vpath)
    }

    pub fn open(&self, vpath: &str) -> Result<OpenFile> {
        self.resolver.open(vpath)
    }

    pub fn read_link(&self, vpath: &str) -> Result<PathBuf> {
        self.resolver.read_link(vpath)
    }

    pub fn path_of(&self, id: NodeId) -> Option<String> {
        self.resolver.path_of(id)
    }

    pub fn status(&self) -> MountStatus {
        MountStatus {
            broker: self.broker.status(),
            index_cache: self.store().index_cache_stats(),
            identities: self.resolver.identities().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LazyFsError;

    #[test]
    fn test_open_requires_cache_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = Mount::new(MountConfig::new(dir.path().join("missing"))).unwrap_err();
        assert!(matches!(err, LazyFsError::Configuration(_)));
    }

    #[test]
    fn test_control_channel_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let mount = Mount::new(MountConfig::new(dir.path())).unwrap();

        let channel = mount.open_control().unwrap();
        assert!(matches!(
            mount.open_control(),
            Err(LazyFsError::AlreadyInUse)
        ));
        drop(channel);
        assert!(mount.open_control().is_ok());
    }

    #[test]
    fn test_status() {
        let dir = tempfile::tempdir().unwrap();
        let mount = Mount::new(MountConfig::new(dir.path())).unwrap();
        mount.lookup("/.lazyfs-helper").unwrap();

        let status = mount.status();
        assert!(!status.broker.attached);
        assert_eq!(status.broker.stats.created, 0);
        assert_eq!(status.identities, 2);
    }
}
