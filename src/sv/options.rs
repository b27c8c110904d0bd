use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::sv::config;
use crate::sv::procfile;
use crate::sv::project;

pub const DEFAULT_STOP_SIGNAL: &str = "TERM";

fn max_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Resolved per-process configuration. Immutable once the process is
/// registered; also the value stored per process in a snapshot dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOption {
    pub root: PathBuf,
    pub pid_root: PathBuf,
    pub log_root: PathBuf,
    pub stop_signal: String,
    pub num_procs: usize,
    pub env: BTreeMap<String, String>,
    pub cmd: Vec<String>,
}

/// One project's authoritative description: identity, file locations and
/// the per-process options keyed by process name, in Procfile order.
#[derive(Debug, Clone, Default)]
pub struct ProcfileOption {
    pub app_name: String,
    pub work_dir: PathBuf,
    pub procfile: PathBuf,
    pub env: BTreeMap<String, String>,
    pub processes: IndexMap<String, ProcessOption>,
}

impl ProcfileOption {
    /// A name-only option, used to address an already-registered project.
    pub fn named(app_name: impl Into<String>) -> Self {
        Self { app_name: app_name.into(), ..Self::default() }
    }
}

// -------- Procfile.options file schema (strict; all fields optional) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessOptionFile {
    #[serde(default)]
    root: Option<PathBuf>,
    #[serde(default)]
    pid_root: Option<PathBuf>,
    #[serde(default)]
    log_root: Option<PathBuf>,
    #[serde(default)]
    stop_signal: Option<String>,
    #[serde(default)]
    num_procs: Option<usize>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsFile {
    #[serde(default)]
    app_name: Option<String>,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default)]
    procfile: Option<PathBuf>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    processes: Option<IndexMap<String, ProcessOptionFile>>,
}

/// Merge environment maps left to right; later entries override earlier
/// ones (daemon global env ◁ project env ◁ process env).
pub fn merge_env(
    global: &BTreeMap<String, String>,
    layers: &[&BTreeMap<String, String>],
) -> BTreeMap<String, String> {
    let mut merged = global.clone();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// A command containing quotes is handed to the shell verbatim; anything
/// else is split on spaces into argv.
pub fn command_argv(cmd: &str) -> Vec<String> {
    if cmd.contains('"') || cmd.contains('\'') {
        vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]
    } else {
        cmd.split_whitespace().map(str::to_string).collect()
    }
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

/// Load `Procfile` plus the optional `Procfile.options` overlay from a
/// work directory into an authoritative project description.
///
/// Defaults per process: root ← workdir, pid/log roots ← `<workdir>/tmp`,
/// stop_signal ← TERM, num_procs clamped to 1..=numCPUs. Option entries
/// for process names absent from the Procfile are dropped.
pub fn load_procfile_option(
    cwd: &Path,
    procfile_path: &Path,
    global_env: &BTreeMap<String, String>,
) -> anyhow::Result<ProcfileOption> {
    let cwd = absolute(cwd)?;

    let opts_path = cwd.join("Procfile.options");
    let file: OptionsFile = if opts_path.is_file() {
        let raw = fs::read_to_string(&opts_path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", opts_path.display()))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", opts_path.display()))?
    } else {
        OptionsFile::default()
    };

    let work_dir = match file.workdir {
        Some(ref wd) if !wd.as_os_str().is_empty() => absolute(wd)?,
        _ => cwd.clone(),
    };
    let app_name = match file.app_name {
        Some(ref name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => project::app_name(&cwd)?,
    };
    let procfile_path = match file.procfile {
        Some(ref p) if !p.as_os_str().is_empty() => p.clone(),
        _ => procfile_path.to_path_buf(),
    };
    let resolved_procfile = if procfile_path.is_absolute() {
        procfile_path.clone()
    } else {
        cwd.join(&procfile_path)
    };

    let procfile = procfile::load(&resolved_procfile)?;
    let project_env = file.env.unwrap_or_default();

    // Option entries for names the Procfile does not declare are ignored.
    let mut declared = file.processes.unwrap_or_default();
    declared.retain(|name, _| procfile.contains_key(name));

    let runtime = config::runtime_dir(&work_dir)?;
    let ncpu = max_cpus();

    let mut processes = IndexMap::new();
    for (name, cmd) in procfile.iter() {
        let overlay = declared.shift_remove(name);

        let root = overlay
            .as_ref()
            .and_then(|o| o.root.clone())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| work_dir.clone());
        let pid_root = overlay
            .as_ref()
            .and_then(|o| o.pid_root.clone())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| runtime.clone());
        let log_root = overlay
            .as_ref()
            .and_then(|o| o.log_root.clone())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| runtime.clone());
        let stop_signal = overlay
            .as_ref()
            .and_then(|o| o.stop_signal.clone())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_STOP_SIGNAL.to_string());
        let num_procs = overlay
            .as_ref()
            .and_then(|o| o.num_procs)
            .unwrap_or(1)
            .clamp(1, ncpu);
        let proc_env = overlay.as_ref().and_then(|o| o.env.clone()).unwrap_or_default();

        processes.insert(
            name.clone(),
            ProcessOption {
                root,
                pid_root,
                log_root,
                stop_signal,
                num_procs,
                env: merge_env(global_env, &[&project_env, &proc_env]),
                cmd: command_argv(cmd),
            },
        );
    }

    Ok(ProcfileOption {
        app_name,
        work_dir,
        procfile: resolved_procfile,
        env: project_env,
        processes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_project(procfile: &str, options: Option<&str>) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Procfile"), procfile).unwrap();
        if let Some(opts) = options {
            fs::write(tmp.path().join("Procfile.options"), opts).unwrap();
        }
        tmp
    }

    #[test]
    fn defaults_without_options_file() {
        let tmp = write_project("web: sleep 30\n", None);
        let opt =
            load_procfile_option(tmp.path(), &tmp.path().join("Procfile"), &BTreeMap::new())
                .unwrap();
        let web = opt.processes.get("web").unwrap();
        assert_eq!(web.cmd, vec!["sleep", "30"]);
        assert_eq!(web.stop_signal, "TERM");
        assert_eq!(web.num_procs, 1);
        assert!(web.pid_root.ends_with("tmp"));
        assert!(web.log_root.ends_with("tmp"));
        assert_eq!(web.root, tmp.path());
    }

    #[test]
    fn options_overlay_and_unknown_names_ignored() {
        let options = "\
app_name: myapp
env:
  SHARED: project
processes:
  web:
    stop_signal: INT
    num_procs: 2
    env:
      SHARED: process
  ghost:
    stop_signal: QUIT
";
        let tmp = write_project("web: sleep 30\nworker: sleep 30\n", Some(options));
        let opt =
            load_procfile_option(tmp.path(), &tmp.path().join("Procfile"), &BTreeMap::new())
                .unwrap();
        assert_eq!(opt.app_name, "myapp");
        assert!(!opt.processes.contains_key("ghost"));

        let web = opt.processes.get("web").unwrap();
        assert_eq!(web.stop_signal, "INT");
        assert_eq!(web.env.get("SHARED").map(String::as_str), Some("process"));

        let worker = opt.processes.get("worker").unwrap();
        assert_eq!(worker.stop_signal, "TERM");
        assert_eq!(worker.env.get("SHARED").map(String::as_str), Some("project"));
    }

    #[test]
    fn env_merge_precedence() {
        let mut global = BTreeMap::new();
        global.insert("A".to_string(), "global".to_string());
        global.insert("B".to_string(), "global".to_string());
        global.insert("C".to_string(), "global".to_string());
        let mut project = BTreeMap::new();
        project.insert("B".to_string(), "project".to_string());
        project.insert("C".to_string(), "project".to_string());
        let mut process = BTreeMap::new();
        process.insert("C".to_string(), "process".to_string());

        let merged = merge_env(&global, &[&project, &process]);
        assert_eq!(merged.get("A").map(String::as_str), Some("global"));
        assert_eq!(merged.get("B").map(String::as_str), Some("project"));
        assert_eq!(merged.get("C").map(String::as_str), Some("process"));
    }

    #[test]
    fn quoted_commands_go_through_the_shell() {
        assert_eq!(
            command_argv("sh -c \"trap '' TERM; sleep 60\""),
            vec!["sh", "-c", "sh -c \"trap '' TERM; sleep 60\""]
        );
        assert_eq!(command_argv("sleep 30"), vec!["sleep", "30"]);
    }

    #[test]
    fn num_procs_is_clamped() {
        let options = "\
processes:
  web:
    num_procs: 100000
";
        let tmp = write_project("web: sleep 30\n", Some(options));
        let opt =
            load_procfile_option(tmp.path(), &tmp.path().join("Procfile"), &BTreeMap::new())
                .unwrap();
        let web = opt.processes.get("web").unwrap();
        assert!(web.num_procs >= 1);
        assert!(web.num_procs <= super::max_cpus());
    }
}
