//! Conversion of nodes to FUSE attributes

use std::time::{Duration, SystemTime};

use common::resolver::{Node, NodeKind};
use common::store::system_time;
use fuser::{FileAttr, FileType};

use super::handles::{request_ino, REQUESTS_DIR_INO};

pub fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File | NodeKind::Control => FileType::RegularFile,
        NodeKind::StaticDirectory | NodeKind::DynamicDirectory => FileType::Directory,
        NodeKind::Symlink => FileType::Symlink,
    }
}

/// Kernel entry and attribute timeout for a node. Nodes that must be asked
/// for again on every access are never cached.
pub fn entry_ttl(ttl: Duration, node: &Node) -> Duration {
    if node.is_cacheable() {
        ttl
    } else {
        Duration::ZERO
    }
}

/// Builds attributes owned by the mounting user
#[derive(Debug, Clone, Copy)]
pub struct AttrFactory {
    uid: u32,
    gid: u32,
    started: SystemTime,
}

impl AttrFactory {
    pub fn new() -> Self {
        // SAFETY: neither call has preconditions or can fail
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Self {
            uid,
            gid,
            started: SystemTime::now(),
        }
    }

    pub fn node(&self, node: &Node) -> FileAttr {
        let perm = match node.kind {
            NodeKind::File => 0o444,
            NodeKind::StaticDirectory | NodeKind::DynamicDirectory => 0o555,
            NodeKind::Symlink => 0o777,
            NodeKind::Control => 0o400,
        };
        self.build(
            node.id,
            file_type(node.kind),
            perm,
            node.attr.size,
            system_time(node.attr.mtime),
        )
    }

    pub fn requests_dir(&self) -> FileAttr {
        self.build(REQUESTS_DIR_INO, FileType::Directory, 0o500, 0, self.started)
    }

    pub fn request(&self, id: u64, size: u64) -> FileAttr {
        self.build(
            request_ino(id),
            FileType::RegularFile,
            0o400,
            size,
            self.started,
        )
    }

    fn build(&self, ino: u64, kind: FileType, perm: u16, size: u64, mtime: SystemTime) -> FileAttr {
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Default for AttrFactory {
    fn default() -> Self {
        Self::new()
    }
}
