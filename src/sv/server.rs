use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio::time as tokio_time;

use crate::sv::codec::ResponseCtl;
use crate::sv::session::Session;
use crate::sv::supervisor::Supervisor;

/// Accept loop on the local control socket. Each connection runs as its
/// own session task; a session that returns the Shutdown control flips
/// the termination flag, the loop stops accepting and waits for every
/// in-flight session to finish.
pub async fn serve(
    sv: Arc<Supervisor>,
    socket_path: &Path,
    dump_path: PathBuf,
    shutting_down: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        fs::remove_file(socket_path).map_err(|e| {
            anyhow::anyhow!("failed to remove stale socket {}: {e}", socket_path.display())
        })?;
    }
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", socket_path.display()))?;

    tracing::info!("listening on {}", socket_path.display());

    let mut sessions: JoinSet<()> = JoinSet::new();

    while !shutting_down.load(Ordering::Relaxed) {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _addr)) => {
                        let sv = Arc::clone(&sv);
                        let dump = dump_path.clone();
                        let flag = Arc::clone(&shutting_down);
                        sessions.spawn(async move {
                            let ctl = Session::new(sv, stream, dump).handle().await;
                            if ctl == ResponseCtl::Shutdown {
                                flag.store(true, Ordering::Relaxed);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        tokio_time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            _ = tokio_time::sleep(Duration::from_millis(200)) => {
                // periodic wake so the loop observes the shutdown flag
                // even when no client ever connects again.
            }
        }
        while sessions.try_join_next().is_some() {}
    }

    while sessions.join_next().await.is_some() {}
    tracing::info!("supervisor server is stopped");
    Ok(())
}
