//! Core of an on-demand caching filesystem
//!
//! A mount exposes a virtual tree whose contents are fetched lazily, on
//! first access, by an external helper process, and served from a local
//! cache directory afterwards.
//!
//! - [`store`]: the on-disk cache and its atomic publication discipline
//! - [`index`]: the per-directory index format
//! - [`broker`]: turns cache misses into requests for the helper
//! - [`resolver`]: walks virtual paths against the cache
//! - [`identity`]: stable node ids and mapping arbitration
//! - [`mount`]: the context tying one mounted tree together
//! - [`helper`]: the helper side of the protocol

pub mod broker;
pub mod config;
pub mod error;
pub mod helper;
pub mod identity;
pub mod index;
pub mod mount;
pub mod path;
pub mod resolver;
pub mod store;

pub mod prelude {
    pub use crate::broker::{ControlChannel, RequestHandle};
    pub use crate::config::MountConfig;
    pub use crate::error::{LazyFsError, Result};
    pub use crate::helper::{serve, DirectoryMirror, RequestHandler};
    pub use crate::index::{DirIndex, EntryKind, IndexEntry};
    pub use crate::mount::Mount;
    pub use crate::resolver::{DirEntry, Node, NodeKind, OpenFile};
}
