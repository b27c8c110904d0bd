use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::sv::codec::{decode, encode};
use crate::sv::options::{ProcessOption, ProcfileOption};
use crate::sv::supervisor::Supervisor;

/// Project metadata stored under the bare app-name key; process options
/// are stored under `<app>::<proc>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProjectMeta {
    work_dir: PathBuf,
    procfile: PathBuf,
}

fn open_store(path: &Path) -> anyhow::Result<sled::Db> {
    sled::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open snapshot store {}: {e}", path.display()))
}

/// Walk the registry and persist every project plus every process option.
/// The store is opened, flushed and closed within this call.
pub fn dump(sv: &Supervisor, path: &Path) -> anyhow::Result<()> {
    let db = open_store(path)?;

    for (name, project) in sv.project_table.entries() {
        let meta = ProjectMeta {
            work_dir: project.work_dir.clone(),
            procfile: project.procfile.clone(),
        };
        db.insert(name.as_bytes(), encode(&meta)?)
            .map_err(|e| anyhow::anyhow!("failed to write project {name}: {e}"))?;

        for proc in project.proc_table.values() {
            let opt: ProcessOption = proc.options().clone();
            db.insert(proc.full_name.as_bytes(), encode(&opt)?)
                .map_err(|e| anyhow::anyhow!("failed to write process {}: {e}", proc.full_name))?;
        }
    }

    db.flush()
        .map_err(|e| anyhow::anyhow!("failed to flush snapshot store: {e}"))?;
    Ok(())
}

/// Inverse of dump: read every key, group process options under their
/// project, and re-register each app with the update engine (register
/// pass, then reconcile pass).
pub async fn load(sv: &Supervisor, path: &Path) -> anyhow::Result<()> {
    let db = open_store(path)?;

    let mut opts: IndexMap<String, ProcfileOption> = IndexMap::new();

    for item in db.iter() {
        let (key, value) = item.map_err(|e| anyhow::anyhow!("snapshot iteration failed: {e}"))?;
        let name = String::from_utf8_lossy(&key).to_string();
        if name.contains("::") {
            continue;
        }
        let meta: ProjectMeta = decode(&value)?;
        opts.insert(
            name.clone(),
            ProcfileOption {
                app_name: name,
                work_dir: meta.work_dir,
                procfile: meta.procfile,
                env: Default::default(),
                processes: IndexMap::new(),
            },
        );
    }

    for item in db.iter() {
        let (key, value) = item.map_err(|e| anyhow::anyhow!("snapshot iteration failed: {e}"))?;
        let name = String::from_utf8_lossy(&key).to_string();
        let Some((app, proc)) = name.split_once("::") else {
            continue;
        };
        // Orphan process entries without a project record are skipped.
        let Some(opt) = opts.get_mut(app) else {
            tracing::error!("snapshot process {name} has no project record");
            continue;
        };
        let popt: ProcessOption = decode(&value)?;
        opt.processes.insert(proc.to_string(), popt);
    }

    for (_, opt) in opts.iter() {
        let _ = sv.update_app(true, opt).await;
        let _ = sv.update_app(false, opt).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sv::codec::ProcessState;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn option_with(tmp: &TempDir, app: &str, names: &[&str]) -> ProcfileOption {
        let mut processes = IndexMap::new();
        for name in names {
            let mut env = BTreeMap::new();
            env.insert("APP".to_string(), app.to_string());
            processes.insert(
                name.to_string(),
                ProcessOption {
                    root: tmp.path().to_path_buf(),
                    pid_root: tmp.path().join("tmp"),
                    log_root: tmp.path().join("tmp"),
                    stop_signal: "TERM".to_string(),
                    num_procs: 1,
                    env,
                    cmd: vec!["sleep".to_string(), "30".to_string()],
                },
            );
        }
        ProcfileOption {
            app_name: app.to_string(),
            work_dir: tmp.path().to_path_buf(),
            procfile: tmp.path().join("Procfile"),
            env: BTreeMap::new(),
            processes,
        }
    }

    #[tokio::test]
    async fn dump_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store_path = tmp.path().join("spm.dump");

        let sv = Supervisor::new(BTreeMap::new(), false);
        let first = option_with(&tmp, "first", &["web", "worker"]);
        let second = option_with(&tmp, "second", &["queue", "cron"]);
        sv.update_app(true, &first).await;
        sv.update_app(true, &second).await;

        dump(&sv, &store_path).unwrap();

        let restored = Supervisor::new(BTreeMap::new(), false);
        load(&restored, &store_path).await.unwrap();

        for (app, names) in [("first", ["web", "worker"]), ("second", ["queue", "cron"])] {
            let project = restored.get_project(app).expect("project restored");
            assert_eq!(project.work_dir, tmp.path());
            for name in names {
                let full = format!("{app}::{name}");
                let proc = restored.get_proc_by_name(&full).expect("process restored");
                assert_eq!(proc.current_state(), ProcessState::Standby);
                let original = sv.get_proc_by_name(&full).unwrap();
                assert_eq!(proc.options(), original.options());
            }
        }

        // Structural identity: same key sets on both sides.
        let mut before = sv.proc_table.keys();
        let mut after = restored.proc_table.keys();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn load_skips_orphan_process_records() {
        let tmp = TempDir::new().unwrap();
        let store_path = tmp.path().join("spm.dump");

        {
            let db = sled::open(&store_path).unwrap();
            let opt = ProcessOption {
                root: tmp.path().to_path_buf(),
                pid_root: tmp.path().join("tmp"),
                log_root: tmp.path().join("tmp"),
                stop_signal: "TERM".to_string(),
                num_procs: 1,
                env: BTreeMap::new(),
                cmd: vec!["sleep".to_string(), "1".to_string()],
            };
            db.insert("ghost::web".as_bytes(), encode(&opt).unwrap()).unwrap();
            db.flush().unwrap();
        }

        let sv = Supervisor::new(BTreeMap::new(), false);
        load(&sv, &store_path).await.unwrap();
        assert!(sv.get_proc_by_name("ghost::web").is_none());
        assert!(sv.get_project("ghost").is_none());
    }
}
