use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

use crate::sv::config::LogConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// A clonable append-only file handle usable as a tracing writer.
#[derive(Clone)]
struct SharedFile(Arc<Mutex<File>>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut f = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut f = self.0.lock().unwrap_or_else(|p| p.into_inner());
        f.flush()
    }
}

fn env_filter(level: &str) -> EnvFilter {
    // SPM_LOG_LEVEL wins over the --loglevel flag.
    EnvFilter::try_from_env("SPM_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Initialize tracing for a short-lived client invocation: stderr only.
pub fn init_client(level: &str) {
    TRACING_INIT.get_or_init(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter(level))
            .with_writer(io::stderr)
            .with_target(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Initialize tracing for the daemon. With `file_enabled` and not
/// foreground, lines go to the configured log file; otherwise stderr.
pub fn init_daemon(level: &str, log: &LogConfig, foreground: bool) -> anyhow::Result<()> {
    let mut file_writer = None;
    if log.file_enabled && !foreground {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.file_path)
            .map_err(|e| {
                anyhow::anyhow!("failed to open log file {}: {e}", log.file_path.display())
            })?;
        file_writer = Some(SharedFile(Arc::new(Mutex::new(f))));
    }

    TRACING_INIT.get_or_init(|| {
        let filter = env_filter(level);
        match file_writer {
            Some(file) => {
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(move || file.clone())
                    .with_ansi(false)
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
            None => {
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(io::stderr)
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
        }
    });
    Ok(())
}
