//! FUSE front end
//!
//! - [`LazyFs`]: the fuser filesystem over a [`common::mount::Mount`]
//! - `handles`: open files, directory snapshots, the control file and
//!   request handles
//! - `attr`: node to `FileAttr` conversion and kernel cache timeouts
//!
//! Besides the core's tree, the root gains `.lazyfs-requests/` while a
//! helper holds the control file. Reading the control file yields a request
//! id; the helper opens `.lazyfs-requests/<id>` to read the path and closes
//! it to complete the request.

mod attr;
mod handles;
mod lazy_fs;

pub use attr::{entry_ttl, AttrFactory};
pub use handles::{DirSlot, HandleTable, REQUESTS_DIR};
pub use lazy_fs::{mount, spawn_mount, LazyFs, DEFAULT_TTL};
