//! The read-only FUSE filesystem
//!
//! Every operation that may resolve a path runs on the tokio blocking pool
//! and replies from there: resolution can block on the helper for as long
//! as it takes, and the FUSE session thread must stay free to serve the
//! helper's own reads of the control file.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::error::LazyFsError;
use common::identity::ROOT_ID;
use common::mount::Mount;
use common::path;
use common::resolver::HELPER_FILE;
use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_KEEP_CACHE};
use fuser::{
    Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, Request,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::attr::{entry_ttl, AttrFactory};
use super::handles::{request_id, HandleTable, REQUESTS_DIR, REQUESTS_DIR_INO};
use crate::error::DaemonError;

/// Kernel attribute and entry timeout used unless configured otherwise
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// FUSE front end of a [`Mount`]
pub struct LazyFs {
    mount: Arc<Mount>,
    runtime: Handle,
    handles: Arc<HandleTable>,
    attrs: AttrFactory,
    ttl: Duration,
}

impl LazyFs {
    /// Create the filesystem. Must be called from within a tokio runtime.
    pub fn new(mount: Arc<Mount>, ttl: Duration) -> Result<Self, DaemonError> {
        let runtime = Handle::try_current().map_err(|e| DaemonError::Runtime(e.to_string()))?;
        Ok(Self {
            mount,
            runtime,
            handles: Arc::new(HandleTable::new()),
            attrs: AttrFactory::new(),
            ttl,
        })
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.mount.path_of(ino)
    }
}

fn errno(e: &LazyFsError) -> i32 {
    if !e.is_not_found() {
        debug!(error = %e, "operation failed");
    }
    e.errno()
}

fn control_path() -> String {
    path::join(path::ROOT, HELPER_FILE)
}

impl Filesystem for LazyFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        if parent == REQUESTS_DIR_INO {
            match name.parse().ok().and_then(|id| {
                self.handles
                    .request_size(id)
                    .map(|size| self.attrs.request(id, size))
            }) {
                Some(attr) => reply.entry(&Duration::ZERO, &attr, 0),
                None => reply.error(libc::ENOENT),
            }
            return;
        }
        if parent == ROOT_ID && name == REQUESTS_DIR {
            if self.handles.control_attached() {
                reply.entry(&Duration::ZERO, &self.attrs.requests_dir(), 0);
            } else {
                reply.error(libc::ENOENT);
            }
            return;
        }

        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = path::join(&parent_path, name);
        let mount = self.mount.clone();
        let attrs = self.attrs;
        let ttl = self.ttl;
        self.runtime.spawn_blocking(move || match mount.lookup(&child) {
            Ok(node) => reply.entry(&entry_ttl(ttl, &node), &attrs.node(&node), 0),
            Err(e) => reply.error(errno(&e)),
        });
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == REQUESTS_DIR_INO {
            reply.attr(&Duration::ZERO, &self.attrs.requests_dir());
            return;
        }
        if let Some(id) = request_id(ino) {
            match self.handles.request_size(id) {
                Some(size) => reply.attr(&Duration::ZERO, &self.attrs.request(id, size)),
                None => reply.error(libc::ENOENT),
            }
            return;
        }

        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mount = self.mount.clone();
        let attrs = self.attrs;
        let ttl = self.ttl;
        self.runtime.spawn_blocking(move || match mount.lookup(&path) {
            Ok(node) => reply.attr(&entry_ttl(ttl, &node), &attrs.node(&node)),
            Err(e) => reply.error(errno(&e)),
        });
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mount = self.mount.clone();
        self.runtime
            .spawn_blocking(move || match mount.read_link(&path) {
                Ok(target) => reply.data(target.as_os_str().as_bytes()),
                Err(e) => reply.error(errno(&e)),
            });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
            return;
        }

        if let Some(id) = request_id(ino) {
            match self.handles.open_request(id) {
                Some(fh) => reply.opened(fh, FOPEN_DIRECT_IO),
                None => reply.error(libc::ENOENT),
            }
            return;
        }

        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if path == control_path() {
            match self.handles.attach_control(&self.mount) {
                Ok(fh) => {
                    info!("helper attached through control file");
                    reply.opened(fh, FOPEN_DIRECT_IO);
                }
                Err(e) => reply.error(errno(&e)),
            }
            return;
        }

        let mount = self.mount.clone();
        let handles = self.handles.clone();
        self.runtime.spawn_blocking(move || match mount.open(&path) {
            Ok(file) => {
                let (fh, keep_cache) = handles.insert_file(file);
                let flags = if keep_cache { FOPEN_KEEP_CACHE } else { 0 };
                reply.opened(fh, flags);
            }
            Err(e) => reply.error(errno(&e)),
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        if let Some(channel) = self.handles.control(fh) {
            let handles = self.handles.clone();
            self.runtime
                .spawn_blocking(move || match handles.read_control(&channel) {
                    Ok(announced) => reply.data(&announced),
                    Err(e) => reply.error(errno(&e)),
                });
            return;
        }

        if let Some(bytes) = self.handles.read_request(fh) {
            reply.data(&bytes);
            return;
        }

        let Some(file) = self.handles.file(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match file.read(offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if self.handles.release_control(fh) {
            info!("helper detached through control file");
        } else if !self.handles.release_request(fh) {
            self.handles.release_file(fh);
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        if ino == REQUESTS_DIR_INO {
            reply.opened(self.handles.open_requests_dir(), 0);
            return;
        }
        let Some(dir) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // Listed once per open: paging must not ask the helper again
        let mount = self.mount.clone();
        let handles = self.handles.clone();
        self.runtime
            .spawn_blocking(move || match handles.open_dir(&mount, ino, &dir) {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(errno(&e)),
            });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(page) = self.handles.dir_page(fh, offset) else {
            reply.error(libc::EBADF);
            return;
        };
        for (next, slot) in page {
            if reply.add(slot.ino, next, slot.kind, &slot.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.handles.release_dir(fh);
        reply.ok();
    }

    fn destroy(&mut self) {
        let status = self.mount.status();
        info!(
            requests = status.broker.stats.created,
            open_files = self.handles.open_files(),
            "filesystem unmounted"
        );
    }
}

fn mount_options() -> Vec<MountOption> {
    vec![
        MountOption::RO,
        MountOption::FSName("lazyfs".into()),
        MountOption::Subtype("lazyfs".into()),
    ]
}

/// Mount and serve in the calling thread until unmounted
pub fn mount(fs: LazyFs, mountpoint: &Path) -> Result<(), DaemonError> {
    info!(mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(fs, mountpoint, &mount_options()).map_err(|source| DaemonError::Mount {
        path: mountpoint.to_path_buf(),
        source,
    })
}

/// Mount in the background; dropping the session unmounts
pub fn spawn_mount(fs: LazyFs, mountpoint: &Path) -> Result<fuser::BackgroundSession, DaemonError> {
    info!(mountpoint = %mountpoint.display(), "mounting in background");
    fuser::spawn_mount2(fs, mountpoint, &mount_options()).map_err(|source| {
        warn!(mountpoint = %mountpoint.display(), error = %source, "mount failed");
        DaemonError::Mount {
            path: mountpoint.to_path_buf(),
            source,
        }
    })
}
