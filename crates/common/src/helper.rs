//! Helper side of the request protocol
//!
//! A helper attaches to a mount, takes requests off the control channel one
//! at a time, populates the cache store for each path (or leaves it alone to
//! reject it) and closes the request. [`serve`] runs that loop around a
//! [`RequestHandler`]; [`DirectoryMirror`] is a handler that answers from a
//! local directory tree.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::broker::ControlChannel;
use crate::error::{LazyFsError, Result};
use crate::index::{self, DirIndex, IndexEntry};
use crate::path;
use crate::store::CacheStore;

/// Answers requests for virtual paths.
///
/// Returning `Ok` without publishing anything rejects the path. An `Err`
/// is logged and also ends up as a reject; the request is closed either way.
pub trait RequestHandler: Send {
    fn handle(&mut self, store: &CacheStore, vpath: &str) -> Result<()>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&CacheStore, &str) -> Result<()> + Send,
{
    fn handle(&mut self, store: &CacheStore, vpath: &str) -> Result<()> {
        self(store, vpath)
    }
}

/// Decode what a request handle yields: the path up to its NUL terminator
pub fn parse_request_path(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .ok()
        .filter(|path| path.starts_with('/'))
        .map(str::to_string)
}

/// Serve requests until the channel is detached. Returns the number of
/// requests handled.
pub fn serve<H>(channel: &ControlChannel, store: &CacheStore, handler: &mut H) -> Result<u64>
where
    H: RequestHandler + ?Sized,
{
    let mut served = 0;
    loop {
        let mut request = match channel.next_request() {
            Ok(request) => request,
            Err(LazyFsError::Detached) => {
                info!(served, "helper loop finished");
                return Ok(served);
            }
            Err(e) => return Err(e),
        };

        let Some(vpath) = parse_request_path(&request.read()) else {
            warn!(id = request.id(), "request with unreadable path, rejecting");
            request.close();
            continue;
        };

        debug!(path = %vpath, id = request.id(), "handling request");
        if let Err(e) = handler.handle(store, &vpath) {
            warn!(path = %vpath, error = %e, "handler failed, rejecting");
        }
        request.close();
        served += 1;
    }
}

/// Answers requests by copying from a local origin tree.
///
/// Directories are published with a full listing unless registered as
/// dynamic; files are published with the origin's mtime. Paths missing from
/// the origin are rejected.
#[derive(Debug, Clone)]
pub struct DirectoryMirror {
    origin: PathBuf,
    dynamic: HashSet<String>,
}

impl DirectoryMirror {
    pub fn new(origin: impl Into<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            dynamic: HashSet::new(),
        }
    }

    /// Publish `vpath` as a dynamic directory instead of listing it
    pub fn with_dynamic(mut self, vpath: &str) -> Self {
        self.dynamic.insert(path::normalize(vpath));
        self
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    fn source(&self, vpath: &str) -> PathBuf {
        let mut source = self.origin.clone();
        for segment in path::segments(vpath) {
            source.push(segment);
        }
        source
    }

    fn listing(&self, source: &Path) -> Result<DirIndex> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // Names the index format cannot carry are left out
            if !index::is_valid_name(&name) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_dir() {
                entries.push(IndexEntry::dir(name, meta.mtime()));
            } else if meta.is_file() {
                entries.push(IndexEntry::file(name, meta.len(), meta.mtime()));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        DirIndex::from_entries(entries)
            .map_err(|e| LazyFsError::invalid_index(source, e.to_string()))
    }
}

impl RequestHandler for DirectoryMirror {
    fn handle(&mut self, store: &CacheStore, vpath: &str) -> Result<()> {
        let vpath = path::normalize(vpath);
        let source = self.source(&vpath);
        let meta = match fs::metadata(&source) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %vpath, "not in origin, rejecting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            let index = if self.dynamic.contains(&vpath) {
                DirIndex::Dynamic
            } else {
                self.listing(&source)?
            };
            store.publish_index(&vpath, &index)
        } else if meta.is_file() {
            store.publish_file(&vpath, &fs::read(&source)?)?;
            store.set_mtime(&vpath, meta.mtime())
        } else {
            debug!(path = %vpath, "unsupported file type in origin, rejecting");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;

    fn origin() -> tempfile::TempDir {
        let origin = tempfile::tempdir().unwrap();
        fs::create_dir(origin.path().join("docs")).unwrap();
        fs::write(origin.path().join("hello"), b"Hello").unwrap();
        fs::write(origin.path().join("docs").join("readme"), b"read me").unwrap();
        origin
    }

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(&MountConfig::new(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_parse_request_path() {
        assert_eq!(parse_request_path(b"/a/b\0").as_deref(), Some("/a/b"));
        assert_eq!(parse_request_path(b"/\0").as_deref(), Some("/"));
        assert_eq!(parse_request_path(b"relative\0"), None);
        assert_eq!(parse_request_path(b""), None);
    }

    #[test]
    fn test_mirror_publishes_listing() {
        let origin = origin();
        let (_dir, store) = store();
        let mut mirror = DirectoryMirror::new(origin.path());

        mirror.handle(&store, "/").unwrap();
        let index = store.read_index("/").unwrap().unwrap();
        let names: Vec<&str> = index.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "hello"]);
        assert_eq!(index.find("hello").unwrap().size, 5);
    }

    #[test]
    fn test_mirror_publishes_file_with_mtime() {
        let origin = origin();
        let (_dir, store) = store();
        let mut mirror = DirectoryMirror::new(origin.path());

        mirror.handle(&store, "/docs/readme").unwrap();
        assert_eq!(
            fs::read(store.physical_path("/docs/readme")).unwrap(),
            b"read me"
        );
        let expected = fs::metadata(origin.path().join("docs/readme")).unwrap().mtime();
        assert_eq!(store.stat("/docs/readme").unwrap().unwrap().mtime, expected);
    }

    #[test]
    fn test_mirror_rejects_missing() {
        let origin = origin();
        let (_dir, store) = store();
        let mut mirror = DirectoryMirror::new(origin.path());

        mirror.handle(&store, "/missing").unwrap();
        assert!(store.stat("/missing").unwrap().is_none());
    }

    #[test]
    fn test_mirror_dynamic_directory() {
        let origin = origin();
        let (_dir, store) = store();
        let mut mirror = DirectoryMirror::new(origin.path()).with_dynamic("/docs/");

        mirror.handle(&store, "/docs").unwrap();
        assert!(store.read_index("/docs").unwrap().unwrap().is_dynamic());
    }

    #[test]
    fn test_closure_handler() {
        let (_dir, store) = store();
        let mut seen = Vec::new();
        let mut handler = |_: &CacheStore, vpath: &str| -> Result<()> {
            seen.push(vpath.to_string());
            Ok(())
        };
        handler.handle(&store, "/x").unwrap();
        assert_eq!(seen, vec!["/x"]);
    }
}
