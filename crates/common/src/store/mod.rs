//! On-disk cache store
//!
//! The cache root mirrors the virtual tree: the virtual path `/a/b` lives at
//! `<cache_root>/a/b`. Each cached directory holds an index file named
//! [`INDEX_FILE`] describing its children.
//!
//! # Publication
//!
//! Indices are always published by writing the full content to a staging
//! file in the same directory and renaming it over the canonical name, so a
//! reader observes either the previous index or the complete new one.
//! [`CacheStore::publish_file`] does the same for bodies (replacing the
//! physical file), while [`CacheStore::rewrite_file`] rewrites a body in
//! place (keeping the physical file).
//!
//! The helper is the only writer. The resolver only reads, and treats what
//! is visible at canonical names as the single source of truth.

mod index_cache;

pub use index_cache::{IndexCache, IndexCacheStats, IndexStamp};

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::MountConfig;
use crate::error::{LazyFsError, Result};
use crate::index::{DirIndex, EntryKind, INDEX_FILE};
use crate::path;

/// Prefix of staging files; always starts with [`INDEX_FILE`] so listings
/// skip them
pub const STAGING_PREFIX: &str = "....";

/// Identity of a physical file: replacing a file by rename changes it,
/// rewriting in place does not
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalId {
    pub dev: u64,
    pub ino: u64,
}

impl PhysicalId {
    pub fn of(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalKind {
    File,
    Directory,
    Other,
}

/// What the cache currently holds at a canonical name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalEntry {
    pub kind: PhysicalKind,
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub mtime: i64,
    pub id: PhysicalId,
}

impl PhysicalEntry {
    fn of(meta: &fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_file() {
            PhysicalKind::File
        } else if file_type.is_dir() {
            PhysicalKind::Directory
        } else {
            PhysicalKind::Other
        };
        Self {
            kind,
            size: meta.len(),
            mtime: meta.mtime(),
            id: PhysicalId::of(meta),
        }
    }

    /// True if this entry is of the kind an index declares
    pub fn matches(&self, kind: EntryKind) -> bool {
        matches!(
            (self.kind, kind),
            (PhysicalKind::File, EntryKind::File) | (PhysicalKind::Directory, EntryKind::Directory)
        )
    }
}

/// Durable, atomically published cache of fetched directories and files
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    max_index_bytes: u64,
    indices: IndexCache,
}

impl CacheStore {
    /// Open the cache root described by `config`.
    ///
    /// The root must already exist, be a directory and be owned by the
    /// effective user; anything else is a configuration error.
    pub fn open(config: &MountConfig) -> Result<Self> {
        let root = &config.cache_root;
        let meta = fs::metadata(root).map_err(|e| {
            LazyFsError::Configuration(format!(
                "cache root {} is not accessible: {}",
                root.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(LazyFsError::Configuration(format!(
                "cache root {} is not a directory",
                root.display()
            )));
        }

        // SAFETY: geteuid has no preconditions and cannot fail
        let euid = unsafe { libc::geteuid() };
        if meta.uid() != euid {
            return Err(LazyFsError::Configuration(format!(
                "cache root {} must be owned by user {} (not {})",
                root.display(),
                euid,
                meta.uid()
            )));
        }

        let root = fs::canonicalize(root)?;
        debug!(root = %root.display(), "opened cache store");
        Ok(Self {
            root,
            max_index_bytes: config.max_index_bytes,
            indices: IndexCache::new(config.index_cache_capacity),
        })
    }

    /// Absolute path of the cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the canonical copy of a virtual path lives
    pub fn physical_path(&self, vpath: &str) -> PathBuf {
        let mut physical = self.root.clone();
        for segment in path::segments(vpath) {
            physical.push(segment);
        }
        physical
    }

    fn index_path(&self, dir: &str) -> PathBuf {
        self.physical_path(dir).join(INDEX_FILE)
    }

    /// What the cache holds for a virtual path, if anything
    pub fn stat(&self, vpath: &str) -> Result<Option<PhysicalEntry>> {
        match fs::symlink_metadata(self.physical_path(vpath)) {
            Ok(meta) => Ok(Some(PhysicalEntry::of(&meta))),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and decode the index of a cached directory.
    ///
    /// Returns `None` when the directory or its index has not been
    /// published yet.
    pub fn read_index(&self, dir: &str) -> Result<Option<Arc<DirIndex>>> {
        let index_path = self.index_path(dir);
        let mut file = match File::open(&index_path) {
            Ok(file) => file,
            Err(e) if is_missing(&e) => {
                self.indices.invalidate(dir);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        // Stamp and content come from the same open file, so a concurrent
        // republish cannot pair one version's stamp with another's bytes
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(LazyFsError::invalid_index(
                index_path,
                "not a regular file",
            ));
        }
        let stamp = IndexStamp::of(&meta);
        if let Some(index) = self.indices.get(dir, &stamp) {
            return Ok(Some(index));
        }

        if meta.len() > self.max_index_bytes {
            warn!(dir, size = meta.len(), "directory index too large");
            return Err(LazyFsError::invalid_index(
                index_path,
                format!("{} bytes exceeds limit of {}", meta.len(), self.max_index_bytes),
            ));
        }

        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut bytes)?;
        let index = DirIndex::decode(&bytes).map_err(|e| {
            warn!(dir, error = %e, "invalid directory index");
            LazyFsError::invalid_index(&index_path, e.to_string())
        })?;

        let index = Arc::new(index);
        self.indices.put(dir, stamp, index.clone());
        Ok(Some(index))
    }

    /// Names and kinds physically present in a cached directory, index and
    /// staging files excluded. Used to list dynamic directories.
    pub fn list_physical(&self, dir: &str) -> Result<Vec<(String, EntryKind)>> {
        let entries = match fs::read_dir(self.physical_path(dir)) {
            Ok(entries) => entries,
            Err(e) if is_missing(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(INDEX_FILE) {
                continue;
            }
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                continue;
            };
            children.push((name, kind));
        }
        children.sort();
        Ok(children)
    }

    pub fn index_cache_stats(&self) -> IndexCacheStats {
        self.indices.stats()
    }

    // ---- helper-side operations ----

    /// Create the physical directory for a virtual directory (and its
    /// ancestors)
    pub fn create_dir(&self, dir: &str) -> Result<()> {
        fs::create_dir_all(self.physical_path(dir))?;
        Ok(())
    }

    /// Atomically publish the index of a directory, creating the physical
    /// directory if needed
    pub fn publish_index(&self, dir: &str, index: &DirIndex) -> Result<()> {
        let physical = self.physical_path(dir);
        fs::create_dir_all(&physical)?;
        stage_and_rename(&physical, &physical.join(INDEX_FILE), &index.encode())?;
        debug!(dir, dynamic = index.is_dynamic(), "published directory index");
        Ok(())
    }

    /// Atomically publish a file body. Any previous body is replaced by a new
    /// physical file; existing open handles and mappings keep the old one.
    pub fn publish_file(&self, vpath: &str, contents: &[u8]) -> Result<()> {
        let target = self.physical_path(vpath);
        let parent = target
            .parent()
            .ok_or_else(|| LazyFsError::NotAFile(vpath.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent)?;
        stage_and_rename(&parent, &target, contents)?;
        debug!(path = vpath, size = contents.len(), "published file");
        Ok(())
    }

    /// Rewrite a body in place, keeping its physical file
    pub fn rewrite_file(&self, vpath: &str, contents: &[u8]) -> Result<()> {
        let mut file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.physical_path(vpath))?;
        file.write_all(contents)?;
        file.sync_data()?;
        debug!(path = vpath, size = contents.len(), "rewrote file in place");
        Ok(())
    }

    /// Set the modification time of a cached body (Unix timestamp)
    pub fn set_mtime(&self, vpath: &str, mtime: i64) -> Result<()> {
        let file = File::options()
            .write(true)
            .open(self.physical_path(vpath))?;
        file.set_modified(system_time(mtime))?;
        Ok(())
    }

    /// Remove a cached file or directory tree. Removing something absent is
    /// not an error.
    pub fn remove(&self, vpath: &str) -> Result<()> {
        let physical = self.physical_path(vpath);
        let result = match fs::symlink_metadata(&physical) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&physical),
            Ok(_) => fs::remove_file(&physical),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.indices.invalidate(vpath);
                Ok(())
            }
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn stage_and_rename(dir: &Path, target: &Path, contents: &[u8]) -> Result<()> {
    let mut staged = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(dir)?;
    staged.write_all(contents)?;
    staged.as_file().sync_data()?;
    staged.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// A missing component anywhere along the path
pub(crate) fn is_missing(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

/// Unix timestamp as a `SystemTime`, negative values included
pub fn system_time(mtime: i64) -> SystemTime {
    if mtime >= 0 {
        UNIX_EPOCH + Duration::from_secs(mtime as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(mtime.unsigned_abs())
    }
}
