//! The lazyfs daemon: mounts a [`common::mount::Mount`] through FUSE

pub mod cli;
pub mod error;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod logging;
pub mod mirror;

pub use cli::Args;
pub use error::DaemonError;
pub use mirror::MirrorHelper;
