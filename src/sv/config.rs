use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DAEMON_NAME: &str = "spm";

/// Everything the daemon owns lives under `$HOME/.spm`.
pub fn spm_home() -> anyhow::Result<PathBuf> {
    let home = env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow::anyhow!("HOME is not set; cannot locate the {DAEMON_NAME} home"))?;
    Ok(PathBuf::from(home).join(format!(".{DAEMON_NAME}")))
}

fn home_path(suffix: &str) -> anyhow::Result<PathBuf> {
    Ok(spm_home()?.join(format!("{DAEMON_NAME}.{suffix}")))
}

pub fn daemon_pid_file() -> anyhow::Result<PathBuf> {
    home_path("pid")
}

pub fn daemon_socket() -> anyhow::Result<PathBuf> {
    home_path("sock")
}

pub fn daemon_log_file() -> anyhow::Result<PathBuf> {
    home_path("log")
}

pub fn daemon_dump_dir() -> anyhow::Result<PathBuf> {
    home_path("dump")
}

/// Create the daemon home if missing and verify it is a writable directory.
pub fn ensure_spm_home() -> anyhow::Result<PathBuf> {
    let home = spm_home()?;
    if !home.exists() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&home)
            .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", home.display()))?;
    }
    let meta = fs::metadata(&home)
        .map_err(|e| anyhow::anyhow!("failed to stat {}: {e}", home.display()))?;
    anyhow::ensure!(meta.is_dir(), "{} exists but is not a directory", home.display());
    anyhow::ensure!(
        !meta.permissions().readonly(),
        "{} is not writable",
        home.display()
    );
    Ok(home)
}

/// Per-project scratch directory: `<root>/tmp`, created 0755 on demand.
/// Holds pid files and log files unless a process overrides the roots.
pub fn runtime_dir(root: &Path) -> anyhow::Result<PathBuf> {
    let abs = if root.is_absolute() {
        root.to_path_buf()
    } else {
        env::current_dir()?.join(root)
    };
    if abs.exists() {
        anyhow::ensure!(abs.is_dir(), "{} is not a directory", abs.display());
    }

    let tmp = abs.join("tmp");
    match fs::metadata(&tmp) {
        Ok(meta) => {
            anyhow::ensure!(meta.is_dir(), "{} exists but is not a directory", tmp.display());
        }
        Err(_) => {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&tmp)
                .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", tmp.display()))?;
        }
    }
    Ok(tmp)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub file_enabled: bool,
    pub file_path: PathBuf,
    /// Rotation thresholds are accepted for compatibility with external
    /// log-shipping setups; the daemon itself only appends.
    pub file_size: u32,
    pub file_compress: bool,
    pub max_age: u32,
    pub max_backups: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemonize: bool,
    pub pidfile: PathBuf,
    pub socket: PathBuf,
    pub log: LogConfig,
    pub env: BTreeMap<String, String>,
}

impl DaemonConfig {
    pub fn defaults() -> anyhow::Result<Self> {
        Ok(Self {
            daemonize: true,
            pidfile: daemon_pid_file()?,
            socket: daemon_socket()?,
            log: LogConfig {
                level: "debug".to_string(),
                file_enabled: true,
                file_path: daemon_log_file()?,
                file_size: 10,
                file_compress: false,
                max_age: 7,
                max_backups: 7,
            },
            env: BTreeMap::new(),
        })
    }
}

// -------- YAML file schema (all fields optional; overlaid onto defaults) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogConfigFile {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    file_enabled: Option<bool>,
    #[serde(default)]
    file_path: Option<PathBuf>,
    #[serde(default)]
    file_size: Option<u32>,
    #[serde(default)]
    file_compress: Option<bool>,
    #[serde(default)]
    max_age: Option<u32>,
    #[serde(default)]
    max_backups: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonConfigFile {
    #[serde(default)]
    daemonize: Option<bool>,
    #[serde(default)]
    pidfile: Option<PathBuf>,
    #[serde(default)]
    socket: Option<PathBuf>,
    #[serde(default)]
    log: Option<LogConfigFile>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
}

fn config_candidates(workdir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let name = format!("{DAEMON_NAME}.yml");
    Ok(vec![
        workdir.join(&name),
        workdir.join("etc").join(&name),
        workdir.join("..").join("etc").join(&name),
        spm_home()?.join(&name),
    ])
}

/// Load the daemon configuration: defaults, overlaid with the first
/// `spm.yml` found near the work directory, overlaid with `SPM_*`
/// environment variables. A missing file is not an error.
pub fn load(workdir: &Path) -> anyhow::Result<DaemonConfig> {
    let mut cfg = DaemonConfig::defaults()?;

    for candidate in config_candidates(workdir)? {
        if !candidate.is_file() {
            continue;
        }
        let raw = fs::read_to_string(&candidate)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", candidate.display()))?;
        let file: DaemonConfigFile = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", candidate.display()))?;
        apply_file(&mut cfg, file);
        break;
    }

    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn apply_file(cfg: &mut DaemonConfig, file: DaemonConfigFile) {
    if let Some(v) = file.daemonize {
        cfg.daemonize = v;
    }
    if let Some(v) = file.pidfile {
        cfg.pidfile = v;
    }
    if let Some(v) = file.socket {
        cfg.socket = v;
    }
    if let Some(log) = file.log {
        if let Some(v) = log.level {
            cfg.log.level = v;
        }
        if let Some(v) = log.file_enabled {
            cfg.log.file_enabled = v;
        }
        if let Some(v) = log.file_path {
            cfg.log.file_path = v;
        }
        if let Some(v) = log.file_size {
            cfg.log.file_size = v;
        }
        if let Some(v) = log.file_compress {
            cfg.log.file_compress = v;
        }
        if let Some(v) = log.max_age {
            cfg.log.max_age = v;
        }
        if let Some(v) = log.max_backups {
            cfg.log.max_backups = v;
        }
    }
    if let Some(env) = file.env {
        cfg.env = env;
    }
}

/// `SPM_*` variables override file values, viper-style.
fn apply_env_overrides(cfg: &mut DaemonConfig) {
    if let Ok(v) = env::var("SPM_LOG_LEVEL") {
        if !v.trim().is_empty() {
            cfg.log.level = v.trim().to_string();
        }
    }
    if let Ok(v) = env::var("SPM_PIDFILE") {
        if !v.trim().is_empty() {
            cfg.pidfile = PathBuf::from(v.trim());
        }
    }
    if let Ok(v) = env::var("SPM_SOCKET") {
        if !v.trim().is_empty() {
            cfg.socket = PathBuf::from(v.trim());
        }
    }
    if let Ok(v) = env::var("SPM_DAEMONIZE") {
        match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => cfg.daemonize = true,
            "0" | "false" | "FALSE" | "no" | "NO" => cfg.daemonize = false,
            _ => {}
        }
    }
}
