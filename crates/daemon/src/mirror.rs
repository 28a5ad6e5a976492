//! Built-in helper answering requests from a local directory

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use common::broker::ControlChannel;
use common::helper::{serve, DirectoryMirror};
use common::mount::Mount;
use tracing::{error, info};

use crate::error::DaemonError;

/// A helper thread attached to a mount's control channel
pub struct MirrorHelper {
    channel: Arc<ControlChannel>,
    thread: Option<JoinHandle<u64>>,
}

impl MirrorHelper {
    /// Attach to `mount` and serve requests from `origin` in a new thread
    pub fn spawn(
        mount: &Arc<Mount>,
        origin: &Path,
        dynamic: &[String],
    ) -> Result<Self, DaemonError> {
        let mirror = dynamic
            .iter()
            .fold(DirectoryMirror::new(origin), |mirror, vpath| {
                mirror.with_dynamic(vpath)
            });
        let channel = Arc::new(mount.open_control()?);
        info!(origin = %origin.display(), "built-in helper attached");

        let thread = {
            let channel = channel.clone();
            let mount = mount.clone();
            thread::Builder::new()
                .name("lazyfs-mirror".into())
                .spawn(move || {
                    let mut mirror = mirror;
                    match serve(&channel, mount.store(), &mut mirror) {
                        Ok(served) => served,
                        Err(e) => {
                            error!(error = %e, "built-in helper failed");
                            0
                        }
                    }
                })?
        };

        Ok(Self {
            channel,
            thread: Some(thread),
        })
    }

    /// Detach and wait for the thread. Returns the number of requests served.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.channel.detach();
        self.thread
            .take()
            .and_then(|thread| thread.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for MirrorHelper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
