//! In-memory cache of decoded directory indices
//!
//! Decoding an index on every lookup would re-read and re-parse the same
//! bytes over and over. Entries here are keyed by virtual directory path and
//! tagged with the physical stamp of the index file they were decoded from;
//! a lookup only hits when the file on disk still carries that stamp, so a
//! rename-based republish is picked up immediately.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use moka::sync::Cache;

use crate::index::DirIndex;
use crate::path;

/// Identity of one physical version of an index file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexStamp {
    dev: u64,
    ino: u64,
    len: u64,
    mtime: i64,
    mtime_nsec: i64,
}

impl IndexStamp {
    pub fn of(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            len: meta.len(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedIndex {
    stamp: IndexStamp,
    index: Arc<DirIndex>,
}

/// Bounded cache of decoded indices
#[derive(Clone)]
pub struct IndexCache {
    /// Directory path → decoded index
    indices: Cache<String, CachedIndex>,
    capacity: u64,
}

impl IndexCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            indices: Cache::builder().max_capacity(capacity).build(),
            capacity,
        }
    }

    /// Get the decoded index for a directory, if it was decoded from the
    /// physical file identified by `stamp`
    pub fn get(&self, dir: &str, stamp: &IndexStamp) -> Option<Arc<DirIndex>> {
        let key = path::normalize(dir);
        match self.indices.get(&key) {
            Some(cached) if cached.stamp == *stamp => Some(cached.index),
            Some(_) => {
                self.indices.invalidate(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, dir: &str, stamp: IndexStamp, index: Arc<DirIndex>) {
        self.indices
            .insert(path::normalize(dir), CachedIndex { stamp, index });
    }

    pub fn invalidate(&self, dir: &str) {
        self.indices.invalidate(&path::normalize(dir));
    }

    pub fn invalidate_all(&self) {
        self.indices.invalidate_all();
    }

    pub fn stats(&self) -> IndexCacheStats {
        self.indices.run_pending_tasks();
        IndexCacheStats {
            entry_count: self.indices.entry_count(),
            capacity: self.capacity,
        }
    }
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache")
            .field("capacity", &self.capacity)
            .field("entry_count", &self.indices.entry_count())
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCacheStats {
    pub entry_count: u64,
    pub capacity: u64,
}
