//! Path resolution against a partially populated cache
//!
//! The resolver walks a virtual path one segment at a time. For every
//! segment it needs the parent directory's index: from the cache store when
//! present, otherwise by asking the helper through the broker and reading
//! the store again once the request completes.
//!
//! Visibility is index driven. A child exists if its parent's index
//! declares it, whether or not its body has been fetched yet; a file that
//! sits in the cache directory without being declared does not exist.
//!
//! Dynamic directories have no listing. Looking up a child `c` of a dynamic
//! directory `D` asks the helper for `D/c` every time, and the child exists
//! iff something is physically present at its canonical name afterwards.
//! Listing `D` asks for `D` itself every time and reports what is physically
//! present.
//!
//! Two built-in entries live in the root and never touch the cache or the
//! helper: [`HELPER_FILE`], the control channel, and [`CACHE_LINK`], a
//! symlink to the cache root.

mod open_file;

pub use open_file::OpenFile;

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::{LazyFsError, Result};
use crate::identity::{IdentityTable, MappingArbiter, NodeId};
use crate::index::{DirIndex, EntryKind, IndexEntry, INDEX_FILE};
use crate::path;
use crate::store::{CacheStore, PhysicalEntry, PhysicalId, PhysicalKind};

/// Name of the helper control file in the root
pub const HELPER_FILE: &str = ".lazyfs-helper";

/// Name of the symlink to the cache root in the root
pub const CACHE_LINK: &str = ".lazyfs-cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    /// A directory with a fixed listing, or whose index is not known yet
    StaticDirectory,
    /// A directory that is asked for again on every access
    DynamicDirectory,
    Symlink,
    /// The helper control file
    Control,
}

impl NodeKind {
    pub fn is_dir(self) -> bool {
        matches!(self, NodeKind::StaticDirectory | NodeKind::DynamicDirectory)
    }
}

/// Attributes reported for a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeAttr {
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub mtime: i64,
}

/// A resolved virtual node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub path: String,
    pub kind: NodeKind,
    pub attr: NodeAttr,
    /// Child of a dynamic directory; it only exists as of the last request
    pub volatile: bool,
}

impl Node {
    /// Whether a client may remember this node without asking again
    pub fn is_cacheable(&self) -> bool {
        !self.volatile
            && !matches!(self.kind, NodeKind::DynamicDirectory | NodeKind::Control)
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

/// Outcome of walking a path, before attributes are gathered
#[derive(Debug)]
struct Resolved {
    path: String,
    kind: NodeKind,
    /// What the parent index says about this node, if it has a listing
    hint: Option<IndexEntry>,
    volatile: bool,
}

impl Resolved {
    fn root() -> Self {
        Self {
            path: path::ROOT.to_string(),
            kind: NodeKind::StaticDirectory,
            hint: None,
            volatile: false,
        }
    }
}

fn builtin(name: &str) -> Option<NodeKind> {
    match name {
        HELPER_FILE => Some(NodeKind::Control),
        CACHE_LINK => Some(NodeKind::Symlink),
        _ => None,
    }
}

/// Resolves virtual paths, fetching through the broker on cache misses
#[derive(Debug)]
pub struct Resolver {
    store: CacheStore,
    broker: Arc<Broker>,
    identities: IdentityTable,
    mappings: Arc<MappingArbiter>,
    revalidate: bool,
    /// Timestamp reported for the built-in entries
    started: i64,
}

impl Resolver {
    pub fn new(store: CacheStore, broker: Arc<Broker>, revalidate: bool) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            store,
            broker,
            identities: IdentityTable::new(),
            mappings: Arc::new(MappingArbiter::new()),
            revalidate,
            started,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn identities(&self) -> &IdentityTable {
        &self.identities
    }

    pub fn mappings(&self) -> &Arc<MappingArbiter> {
        &self.mappings
    }

    /// Path previously exposed under `id`
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        self.identities.get_path(id)
    }

    /// Resolve a virtual path to a node, fetching whatever indices are
    /// missing along the way
    pub fn lookup(&self, vpath: &str) -> Result<Node> {
        let resolved = self.resolve(vpath)?;
        let attr = self.attr_of(&resolved)?;
        let id = self.identities.get_or_assign(&resolved.path);
        Ok(Node {
            id,
            path: resolved.path,
            kind: resolved.kind,
            attr,
            volatile: resolved.volatile,
        })
    }

    /// Attributes of a node. Files report their index hints until the body
    /// has been fetched, and their physical size and mtime afterwards.
    pub fn stat(&self, vpath: &str) -> Result<NodeAttr> {
        Ok(self.lookup(vpath)?.attr)
    }

    /// List a directory. The root listing always starts with the built-in
    /// entries.
    pub fn read_dir(&self, vpath: &str) -> Result<Vec<DirEntry>> {
        let resolved = self.resolve(vpath)?;
        if !resolved.kind.is_dir() {
            return Err(LazyFsError::NotADirectory(resolved.path));
        }
        let dir = resolved.path;
        let is_root = path::is_root(&dir);

        let mut entries = Vec::new();
        if is_root {
            for (name, kind) in [
                (HELPER_FILE, NodeKind::Control),
                (CACHE_LINK, NodeKind::Symlink),
            ] {
                entries.push(DirEntry {
                    id: self.identities.get_or_assign(&path::join(&dir, name)),
                    name: name.to_string(),
                    kind,
                });
            }
        }

        // A listing is only trusted when it is static; anything else is
        // asked for again
        let index = match self.peek_index(&dir) {
            Ok(Some(index)) if !index.is_dynamic() => Some(index),
            Ok(_) | Err(LazyFsError::KindMismatch(_)) => {
                self.broker.fetch(&dir)?;
                self.peek_index(&dir)?
            }
            Err(e) => return Err(e),
        };

        let children: Vec<(String, EntryKind)> = match index.as_deref() {
            None if is_root => Vec::new(),
            None => {
                debug!(path = %dir, "directory has no index after fetch");
                return Err(LazyFsError::NotFound(dir));
            }
            Some(DirIndex::Dynamic) => self.store.list_physical(&dir)?,
            Some(DirIndex::Listing(listing)) => listing
                .iter()
                .map(|entry| (entry.name.clone(), entry.kind))
                .collect(),
        };

        for (name, kind) in children {
            if is_root && builtin(&name).is_some() {
                continue;
            }
            let child = path::join(&dir, &name);
            let kind = match kind {
                EntryKind::File => NodeKind::File,
                EntryKind::Directory => self.directory_kind(&child).unwrap_or_else(|e| {
                    debug!(path = %child, error = %e, "cannot classify directory");
                    NodeKind::StaticDirectory
                }),
            };
            entries.push(DirEntry {
                id: self.identities.get_or_assign(&child),
                name,
                kind,
            });
        }

        debug!(path = %dir, count = entries.len(), "listed directory");
        Ok(entries)
    }

    /// Resolve a file and open its cached body, fetching it first if needed
    pub fn open(&self, vpath: &str) -> Result<OpenFile> {
        let resolved = self.resolve(vpath)?;
        match resolved.kind {
            NodeKind::File => {}
            NodeKind::StaticDirectory | NodeKind::DynamicDirectory => {
                return Err(LazyFsError::IsADirectory(resolved.path))
            }
            NodeKind::Symlink | NodeKind::Control => {
                return Err(LazyFsError::NotAFile(resolved.path))
            }
        }

        self.ensure_body(&resolved)?;

        let file = match File::open(self.store.physical_path(&resolved.path)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LazyFsError::NotFound(resolved.path))
            }
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(LazyFsError::KindMismatch(resolved.path));
        }

        let node = Node {
            id: self.identities.get_or_assign(&resolved.path),
            path: resolved.path,
            kind: NodeKind::File,
            attr: NodeAttr {
                size: meta.len(),
                mtime: meta.mtime(),
            },
            volatile: resolved.volatile,
        };
        debug!(path = %node.path, id = node.id, size = node.attr.size, "opened file");
        Ok(OpenFile::new(
            node,
            file,
            PhysicalId::of(&meta),
            self.mappings.clone(),
        ))
    }

    /// Target of the cache symlink
    pub fn read_link(&self, vpath: &str) -> Result<PathBuf> {
        let resolved = self.resolve(vpath)?;
        match resolved.kind {
            NodeKind::Symlink => Ok(self.store.root().to_path_buf()),
            _ => Err(LazyFsError::NotAFile(resolved.path)),
        }
    }

    fn resolve(&self, vpath: &str) -> Result<Resolved> {
        let target = path::normalize(vpath);
        let names: Vec<&str> = path::segments(&target).collect();

        let mut current = Resolved::root();
        for (depth, name) in names.iter().enumerate() {
            let last = depth + 1 == names.len();
            if depth == 0 {
                if let Some(kind) = builtin(name) {
                    let path = path::join(path::ROOT, name);
                    if !last {
                        return Err(LazyFsError::NotADirectory(path));
                    }
                    return Ok(Resolved {
                        path,
                        kind,
                        hint: None,
                        volatile: false,
                    });
                }
            }
            if !current.kind.is_dir() {
                return Err(LazyFsError::NotADirectory(current.path));
            }
            current = self.resolve_child(&current.path, name)?;
        }

        if current.kind.is_dir() {
            current.kind = self.directory_kind(&current.path)?;
        }
        Ok(current)
    }

    fn resolve_child(&self, dir: &str, name: &str) -> Result<Resolved> {
        let child = path::join(dir, name);
        // Names that can never be entries are not worth a request
        if name == ".." || name.starts_with(INDEX_FILE) {
            return Err(LazyFsError::NotFound(child));
        }

        let index = self
            .ensure_index(dir)?
            .ok_or_else(|| LazyFsError::NotFound(child.clone()))?;

        match &*index {
            DirIndex::Dynamic => {
                debug!(path = %child, "resolving child of dynamic directory");
                self.broker.fetch(&child)?;
                let kind = match self.store.stat(&child)? {
                    Some(PhysicalEntry {
                        kind: PhysicalKind::File,
                        ..
                    }) => NodeKind::File,
                    Some(PhysicalEntry {
                        kind: PhysicalKind::Directory,
                        ..
                    }) => NodeKind::StaticDirectory,
                    _ => {
                        debug!(path = %child, "helper did not provide dynamic entry");
                        return Err(LazyFsError::NotFound(child));
                    }
                };
                Ok(Resolved {
                    path: child,
                    kind,
                    hint: None,
                    volatile: true,
                })
            }
            DirIndex::Listing(_) => {
                let entry = index
                    .find(name)
                    .ok_or_else(|| LazyFsError::NotFound(child.clone()))?;
                let kind = match entry.kind {
                    EntryKind::File => NodeKind::File,
                    EntryKind::Directory => NodeKind::StaticDirectory,
                };
                Ok(Resolved {
                    path: child,
                    kind,
                    hint: Some(entry.clone()),
                    volatile: false,
                })
            }
        }
    }

    /// The index of a directory as currently cached, without asking the
    /// helper. `KindMismatch` if the cache holds something else there.
    fn peek_index(&self, dir: &str) -> Result<Option<Arc<DirIndex>>> {
        match self.store.stat(dir)? {
            None => Ok(None),
            Some(entry) if entry.kind == PhysicalKind::Directory => self.store.read_index(dir),
            Some(_) => Err(LazyFsError::KindMismatch(dir.to_string())),
        }
    }

    /// The index of a directory, asking the helper once if it is missing
    fn ensure_index(&self, dir: &str) -> Result<Option<Arc<DirIndex>>> {
        match self.peek_index(dir) {
            Ok(Some(index)) => return Ok(Some(index)),
            Ok(None) | Err(LazyFsError::KindMismatch(_)) => {}
            Err(e) => return Err(e),
        }
        debug!(path = dir, "directory index missing");
        self.broker.fetch(dir)?;
        self.peek_index(dir)
    }

    /// Make sure a usable body is cached for a file node
    fn ensure_body(&self, resolved: &Resolved) -> Result<()> {
        let vpath = &resolved.path;
        if let Some(entry) = self.store.stat(vpath)? {
            if entry.kind == PhysicalKind::File && !self.is_stale(&entry, resolved.hint.as_ref()) {
                return Ok(());
            }
            debug!(path = %vpath, "cached body unusable, asking again");
        }

        self.broker.fetch(vpath)?;
        match self.store.stat(vpath)? {
            Some(entry) if entry.kind == PhysicalKind::File => Ok(()),
            Some(_) => {
                warn!(path = %vpath, "cache holds a non-file where a file is declared");
                Err(LazyFsError::KindMismatch(vpath.clone()))
            }
            None => {
                debug!(path = %vpath, "helper did not provide file");
                Err(LazyFsError::NotFound(vpath.clone()))
            }
        }
    }

    fn is_stale(&self, entry: &PhysicalEntry, hint: Option<&IndexEntry>) -> bool {
        self.revalidate
            && hint.is_some_and(|hint| hint.size != entry.size || hint.mtime != entry.mtime)
    }

    /// Dynamic only if the directory's own index says so
    fn directory_kind(&self, dir: &str) -> Result<NodeKind> {
        match self.peek_index(dir) {
            Ok(Some(index)) if index.is_dynamic() => Ok(NodeKind::DynamicDirectory),
            Ok(_) | Err(LazyFsError::KindMismatch(_)) => Ok(NodeKind::StaticDirectory),
            Err(e) => Err(e),
        }
    }

    fn attr_of(&self, resolved: &Resolved) -> Result<NodeAttr> {
        let hinted = || {
            resolved
                .hint
                .as_ref()
                .map(|hint| NodeAttr {
                    size: hint.size,
                    mtime: hint.mtime,
                })
                .unwrap_or_default()
        };

        let attr = match resolved.kind {
            NodeKind::Control => NodeAttr {
                size: 0,
                mtime: self.started,
            },
            NodeKind::Symlink => NodeAttr {
                size: self.store.root().as_os_str().len() as u64,
                mtime: self.started,
            },
            NodeKind::File => match self.store.stat(&resolved.path)? {
                Some(entry) if entry.kind == PhysicalKind::File => NodeAttr {
                    size: entry.size,
                    mtime: entry.mtime,
                },
                _ => hinted(),
            },
            NodeKind::StaticDirectory | NodeKind::DynamicDirectory => {
                match self.store.stat(&resolved.path)? {
                    Some(entry) if entry.kind == PhysicalKind::Directory => NodeAttr {
                        size: 0,
                        mtime: entry.mtime,
                    },
                    _ => NodeAttr {
                        size: 0,
                        mtime: hinted().mtime,
                    },
                }
            }
        };
        Ok(attr)
    }
}
