use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::SecondsFormat;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

use crate::sv::config::{self, DaemonConfig};
use crate::sv::server;
use crate::sv::supervisor::Supervisor;

/// Synchronous entry point for the `daemon` subcommand; builds the
/// runtime and drives the async daemon to completion.
pub fn run(cfg: DaemonConfig, foreground: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_async(cfg, foreground))
}

pub async fn run_async(cfg: DaemonConfig, foreground: bool) -> anyhow::Result<()> {
    config::ensure_spm_home()?;
    write_daemon_pid(&cfg)?;

    let sv = Supervisor::new(cfg.env.clone(), foreground);
    let shutting_down = Arc::new(AtomicBool::new(false));
    start_signal_listener(Arc::clone(&shutting_down));

    if foreground {
        println!(
            "\x1b[1;33;40mSpm supervisor started at {}\x1b[0m\n",
            sv.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }
    tracing::info!("spm supervisor PID {}", sv.pid);

    let dump_path = config::daemon_dump_dir()?;
    let result = server::serve(
        Arc::clone(&sv),
        &cfg.socket,
        dump_path,
        Arc::clone(&shutting_down),
    )
    .await;

    // Signal path and shutdown action converge here; stop_all on already
    // stopped processes is a no-op.
    sv.shutdown().await;

    let _ = fs::remove_file(&cfg.pidfile);
    let _ = fs::remove_file(&cfg.socket);
    tracing::info!("supervisor daemon stopped");

    result
}

fn write_daemon_pid(cfg: &DaemonConfig) -> anyhow::Result<()> {
    fs::write(&cfg.pidfile, std::process::id().to_string()).map_err(|e| {
        anyhow::anyhow!("failed to write pid file {}: {e}", cfg.pidfile.display())
    })
}

fn start_signal_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut quit = unix_signal(SignalKind::quit()).expect("SIGQUIT handler");
        tokio::select! {
            _ = term.recv() => { flag.store(true, Ordering::Relaxed); }
            _ = int.recv() => { flag.store(true, Ordering::Relaxed); }
            _ = quit.recv() => { flag.store(true, Ordering::Relaxed); }
        }
    });
}
