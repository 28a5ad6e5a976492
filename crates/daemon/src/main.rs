use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use common::mount::Mount;
use lazyfs_daemon::{logging, Args, MirrorHelper};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.log_dir.as_deref())?;

    let config = args.mount_config()?;
    let mount = Arc::new(
        Mount::new(config)
            .with_context(|| format!("opening cache for {}", args.mountpoint.display()))?,
    );

    let helper = match &args.mirror {
        Some(origin) => Some(MirrorHelper::spawn(&mount, origin, &args.dynamic)?),
        None => None,
    };

    run(&args, mount).await?;

    if let Some(helper) = helper {
        let served = helper.stop();
        info!(served, "built-in helper stopped");
    }
    Ok(())
}

#[cfg(feature = "fuse")]
async fn run(args: &Args, mount: Arc<Mount>) -> anyhow::Result<()> {
    use lazyfs_daemon::fuse::{spawn_mount, LazyFs};

    let fs = LazyFs::new(mount, args.attr_ttl())?;
    let session = spawn_mount(fs, &args.mountpoint)?;
    info!(mountpoint = %args.mountpoint.display(), "mounted, press Ctrl+C to unmount");

    shutdown_signal().await;
    info!("unmounting");
    drop(session);
    Ok(())
}

#[cfg(not(feature = "fuse"))]
async fn run(_args: &Args, _mount: Arc<Mount>) -> anyhow::Result<()> {
    anyhow::bail!("lazyfs was built without FUSE support; rebuild with --features fuse")
}

#[cfg(feature = "fuse")]
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
