//! Open handles of the FUSE adapter
//!
//! Four kinds of handle live here: open cached files, open directories, the
//! control file (held by the one attached helper) and request handles.
//!
//! Directory handles hold the listing taken when the directory was opened,
//! so the kernel can page through it without asking the helper again.
//!
//! A control file read yields `"<id> "`. The request it names shows up as
//! `/.lazyfs-requests/<id>` until the helper opens it; reading that file
//! yields the virtual path and releasing it completes the request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::broker::{ControlChannel, RequestHandle, RequestId};
use common::error::{LazyFsError, Result};
use common::identity::{NodeId, ROOT_ID};
use common::mount::Mount;
use common::path;
use common::resolver::OpenFile;
use common::store::PhysicalId;
use fuser::FileType;
use parking_lot::Mutex;
use tracing::debug;

use super::attr::file_type;

/// Directory holding request handles, in the root
pub const REQUESTS_DIR: &str = ".lazyfs-requests";

/// Inodes at or above this value belong to request handles
pub const REQUEST_INO_BASE: u64 = 1 << 62;

pub const REQUESTS_DIR_INO: u64 = REQUEST_INO_BASE - 1;

pub fn request_ino(id: RequestId) -> u64 {
    REQUEST_INO_BASE + id
}

pub fn request_id(ino: u64) -> Option<RequestId> {
    ino.checked_sub(REQUEST_INO_BASE).filter(|id| *id > 0)
}

/// One entry of an open directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSlot {
    pub ino: u64,
    pub kind: FileType,
    pub name: String,
}

impl DirSlot {
    fn dir(ino: u64, name: &str) -> Self {
        Self {
            ino,
            kind: FileType::Directory,
            name: name.to_string(),
        }
    }
}

struct ControlSlot {
    fh: u64,
    channel: Arc<ControlChannel>,
}

/// File handles handed out to the kernel
pub struct HandleTable {
    next_fh: AtomicU64,
    files: Mutex<HashMap<u64, Arc<OpenFile>>>,
    /// Listings taken at opendir
    dirs: Mutex<HashMap<u64, Arc<Vec<DirSlot>>>>,
    control: Mutex<Option<ControlSlot>>,
    /// Delivered through the control file, not opened yet
    pending: Mutex<HashMap<RequestId, RequestHandle>>,
    /// Opened request handles by file handle
    requests: Mutex<HashMap<u64, RequestHandle>>,
    /// Last physical file opened per node
    generations: Mutex<HashMap<NodeId, PhysicalId>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            control: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
        }
    }

    fn alloc(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    /// Register an open file. The flag is true when the node is still
    /// backed by the physical file of its previous open, so the kernel may
    /// keep its page cache.
    pub fn insert_file(&self, file: OpenFile) -> (u64, bool) {
        let keep_cache = {
            let mut generations = self.generations.lock();
            let previous = generations.insert(file.node().id, file.generation());
            previous == Some(file.generation())
        };
        let fh = self.alloc();
        self.files.lock().insert(fh, Arc::new(file));
        (fh, keep_cache)
    }

    pub fn file(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.files.lock().get(&fh).cloned()
    }

    pub fn release_file(&self, fh: u64) -> bool {
        self.files.lock().remove(&fh).is_some()
    }

    pub fn open_files(&self) -> usize {
        self.files.lock().len()
    }

    /// List `dir` once and keep the listing, with `.` and `..`, for the
    /// life of the returned handle
    pub fn open_dir(&self, mount: &Mount, ino: u64, dir: &str) -> Result<u64> {
        let listing = mount.read_dir(dir)?;
        let parent_ino = mount
            .resolver()
            .identities()
            .get_id(&path::parent(dir))
            .unwrap_or(ROOT_ID);

        let mut slots = vec![DirSlot::dir(ino, "."), DirSlot::dir(parent_ino, "..")];
        slots.extend(listing.into_iter().map(|entry| DirSlot {
            ino: entry.id,
            kind: file_type(entry.kind),
            name: entry.name,
        }));
        Ok(self.insert_dir(slots))
    }

    /// Open the request directory. Request handles are reachable by name
    /// only, so it lists nothing else.
    pub fn open_requests_dir(&self) -> u64 {
        self.insert_dir(vec![
            DirSlot::dir(REQUESTS_DIR_INO, "."),
            DirSlot::dir(ROOT_ID, ".."),
        ])
    }

    fn insert_dir(&self, slots: Vec<DirSlot>) -> u64 {
        let fh = self.alloc();
        self.dirs.lock().insert(fh, Arc::new(slots));
        fh
    }

    /// Entries after `offset`, each paired with the offset that resumes
    /// after it. `None` for an unknown handle.
    pub fn dir_page(&self, fh: u64, offset: i64) -> Option<Vec<(i64, DirSlot)>> {
        let slots = self.dirs.lock().get(&fh).cloned()?;
        let skip = usize::try_from(offset).unwrap_or(0);
        Some(
            slots
                .iter()
                .enumerate()
                .skip(skip)
                .map(|(i, slot)| ((i + 1) as i64, slot.clone()))
                .collect(),
        )
    }

    pub fn release_dir(&self, fh: u64) -> bool {
        self.dirs.lock().remove(&fh).is_some()
    }

    /// Attach as the helper through the control file
    pub fn attach_control(&self, mount: &Mount) -> Result<u64> {
        let channel = mount.open_control()?;
        let fh = self.alloc();
        *self.control.lock() = Some(ControlSlot {
            fh,
            channel: Arc::new(channel),
        });
        Ok(fh)
    }

    pub fn control(&self, fh: u64) -> Option<Arc<ControlChannel>> {
        self.control
            .lock()
            .as_ref()
            .filter(|slot| slot.fh == fh)
            .map(|slot| slot.channel.clone())
    }

    pub fn control_attached(&self) -> bool {
        self.control.lock().is_some()
    }

    /// Detach the helper. Requests it was told about but never opened are
    /// closed unanswered.
    pub fn release_control(&self, fh: u64) -> bool {
        let slot = {
            let mut control = self.control.lock();
            match control.as_ref() {
                Some(slot) if slot.fh == fh => control.take(),
                _ => None,
            }
        };
        let Some(slot) = slot else {
            return false;
        };

        slot.channel.detach();
        let unopened: Vec<RequestHandle> = self.pending.lock().drain().map(|(_, h)| h).collect();
        debug!(unopened = unopened.len(), "control file released");
        true
    }

    /// Block for the next request and announce it as `"<id> "`. Yields
    /// nothing once the helper has detached.
    pub fn read_control(&self, channel: &ControlChannel) -> Result<Vec<u8>> {
        match channel.next_request() {
            Ok(request) => Ok(format!("{} ", self.deliver(request)).into_bytes()),
            Err(LazyFsError::Detached) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Remember a request read from the control file
    pub fn deliver(&self, handle: RequestHandle) -> RequestId {
        let id = handle.id();
        self.pending.lock().insert(id, handle);
        id
    }

    /// Size of a request handle's contents, if the request is known
    pub fn request_size(&self, id: RequestId) -> Option<u64> {
        let size = |handle: &RequestHandle| handle.path().len() as u64 + 1;
        if let Some(handle) = self.pending.lock().get(&id) {
            return Some(size(handle));
        }
        self.requests
            .lock()
            .values()
            .find(|handle| handle.id() == id)
            .map(size)
    }

    pub fn open_request(&self, id: RequestId) -> Option<u64> {
        let handle = self.pending.lock().remove(&id)?;
        let fh = self.alloc();
        self.requests.lock().insert(fh, handle);
        Some(fh)
    }

    pub fn read_request(&self, fh: u64) -> Option<Vec<u8>> {
        self.requests.lock().get_mut(&fh).map(RequestHandle::read)
    }

    /// Closing a request handle completes the request
    pub fn release_request(&self, fh: u64) -> bool {
        self.requests.lock().remove(&fh).is_some()
    }
}
