//! Shared fixtures for the integration tests
//!
//! Tests run a real mount over a scratch cache root and play the helper
//! on a separate thread (or step by step on the test thread).

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ::common::prelude::*;
use ::common::store::CacheStore;
use parking_lot::Mutex;
use tempfile::TempDir;

pub struct TestMount {
    pub mount: Arc<Mount>,
    pub cache: TempDir,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn setup_mount() -> TestMount {
    setup_mount_with(|config| config)
}

pub fn setup_mount_with(configure: impl FnOnce(MountConfig) -> MountConfig) -> TestMount {
    init_tracing();
    let cache = tempfile::tempdir().expect("create cache root");
    let config = configure(MountConfig::new(cache.path()));
    let mount = Arc::new(Mount::new(config).expect("open mount"));
    TestMount { mount, cache }
}

/// A small origin tree:
///
/// ```text
/// /hello          "Hello"
/// /docs/readme    "read me"
/// /dyn/a          "dynamic a"
/// ```
pub fn setup_origin() -> TempDir {
    let origin = tempfile::tempdir().expect("create origin");
    let root = origin.path();
    std::fs::write(root.join("hello"), b"Hello").unwrap();
    std::fs::create_dir(root.join("docs")).unwrap();
    std::fs::write(root.join("docs").join("readme"), b"read me").unwrap();
    std::fs::create_dir(root.join("dyn")).unwrap();
    std::fs::write(root.join("dyn").join("a"), b"dynamic a").unwrap();
    origin
}

pub fn mirror(origin: &Path) -> DirectoryMirror {
    DirectoryMirror::new(origin).with_dynamic("/dyn")
}

/// A helper serving requests on its own thread, recording every path it
/// was asked for
pub struct TestHelper {
    channel: Arc<ControlChannel>,
    seen: Arc<Mutex<Vec<String>>>,
    thread: Option<JoinHandle<u64>>,
}

impl TestHelper {
    pub fn spawn<H>(mount: &Arc<Mount>, mut handler: H) -> Self
    where
        H: RequestHandler + 'static,
    {
        let channel = Arc::new(mount.open_control().expect("attach helper"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let thread = {
            let channel = channel.clone();
            let mount = mount.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                let mut recording = |store: &CacheStore, vpath: &str| -> Result<()> {
                    seen.lock().push(vpath.to_string());
                    handler.handle(store, vpath)
                };
                serve(&channel, mount.store(), &mut recording).expect("helper loop")
            })
        };

        Self {
            channel,
            seen,
            thread: Some(thread),
        }
    }

    /// Paths requested so far, in delivery order
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    pub fn count(&self, vpath: &str) -> usize {
        self.seen.lock().iter().filter(|p| *p == vpath).count()
    }

    /// Detach and wait for the loop to finish; returns every requested path
    pub fn stop(mut self) -> Vec<String> {
        self.shutdown();
        self.seen()
    }

    fn shutdown(&mut self) {
        self.channel.detach();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("helper thread panicked");
        }
    }
}

impl Drop for TestHelper {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

/// A helper that answers nothing
pub fn reject_all(_: &CacheStore, _: &str) -> Result<()> {
    Ok(())
}

/// Poll `condition` until it holds or five seconds pass
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}
