use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::sv::codec::ProcessState;
use crate::sv::options::ProcfileOption;
use crate::sv::process::Process;
use crate::sv::project::{full_name, Project, ProjectTable};
use crate::sv::tables::{ProcList, ProcTable};

/// Core controller: owns the project table, the global process table and
/// the dense process index, and keeps them consistent across concurrent
/// requests.
///
/// Individual tables are linearizable via their own locks; `op_lock` is
/// the coarser lock held across multi-table updates so a process's table
/// presence and its project's flag are always read and written together.
pub struct Supervisor {
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    foreground: bool,
    global_env: BTreeMap<String, String>,
    pub(crate) op_lock: Mutex<()>,
    pub(crate) project_table: ProjectTable,
    pub(crate) proc_table: ProcTable,
    pub(crate) proc_list: ProcList,
}

impl Supervisor {
    pub fn new(global_env: BTreeMap<String, String>, foreground: bool) -> Arc<Self> {
        Arc::new(Self {
            started_at: Utc::now(),
            pid: std::process::id(),
            foreground,
            global_env,
            op_lock: Mutex::new(()),
            project_table: ProjectTable::new(),
            proc_table: ProcTable::new(),
            proc_list: ProcList::new(),
        })
    }

    pub fn global_env(&self) -> &BTreeMap<String, String> {
        &self.global_env
    }

    pub fn foreground(&self) -> bool {
        self.foreground
    }

    pub fn get_project(&self, app: &str) -> Option<Arc<Project>> {
        self.project_table.get(app)
    }

    pub fn get_proc_by_name(&self, full: &str) -> Option<Arc<Process>> {
        self.proc_table.get(full)
    }

    /// Reconcile a freshly loaded project description against the live
    /// registry.
    ///
    /// `force = true` registers the project when absent (and is a no-op
    /// when present); `force = false` updates an existing project:
    /// de-declared processes that are not flagged running are removed
    /// from every index, newly declared ones are registered and returned
    /// as the changed set. Running processes are never removed here;
    /// reconfiguring one takes an explicit restart.
    pub async fn update_app(
        &self,
        force: bool,
        opt: &ProcfileOption,
    ) -> (Option<Arc<Project>>, Vec<Arc<Process>>) {
        let _guard = self.op_lock.lock().await;

        let old = self.project_table.get(&opt.app_name);

        if force {
            if let Some(old) = old {
                return (Some(old), Vec::new());
            }
            if opt.processes.is_empty() || opt.work_dir.as_os_str().is_empty() {
                return (None, Vec::new());
            }

            let project = Project::create(opt);
            self.project_table.set(&opt.app_name, project.clone());
            for (name, popt) in opt.processes.iter() {
                let proc = project.register(name, popt, self.foreground);
                self.proc_table.add(&proc.full_name, proc.clone());
                self.proc_list.add(&proc.full_name);
            }
            return (Some(project), Vec::new());
        }

        let Some(old) = old else {
            return (None, Vec::new());
        };

        for name in old.proc_names() {
            if !opt.processes.contains_key(&name) && !old.get_state(&name) {
                let full = full_name(&old.name, &name);
                old.unset(&name);
                old.proc_table.del(&full);
                self.proc_table.del(&full);
                self.proc_list.del(&full);
            }
        }

        let mut changed = Vec::new();
        for (name, popt) in opt.processes.iter() {
            let full = full_name(&old.name, name);
            if let Some(existing) = self.proc_table.get(&full) {
                if existing.current_state() != ProcessState::NotFound {
                    continue;
                }
            }
            let proc = old.register(name, popt, self.foreground);
            self.proc_table.add(&full, proc.clone());
            self.proc_list.add(&full);
            changed.push(proc);
        }

        (Some(old), changed)
    }

    /// Stop everything and flush; invoked from the shutdown action and
    /// from the daemon's signal path. Safe to call more than once.
    pub async fn shutdown(&self) {
        let _ = self.stop_all("*").await;
        tracing::info!("shutdown supervisor...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sv::options::ProcessOption;
    use indexmap::IndexMap;
    use tempfile::TempDir;

    fn option_with(tmp: &TempDir, app: &str, names: &[&str]) -> ProcfileOption {
        let mut processes = IndexMap::new();
        for name in names {
            processes.insert(
                name.to_string(),
                ProcessOption {
                    root: tmp.path().to_path_buf(),
                    pid_root: tmp.path().join("tmp"),
                    log_root: tmp.path().join("tmp"),
                    stop_signal: "TERM".to_string(),
                    num_procs: 1,
                    env: BTreeMap::new(),
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
    async fn register_mode_inserts_once() {
        let tmp = TempDir::new().unwrap();
        let sv = Supervisor::new(BTreeMap::new(), false);
        let opt = option_with(&tmp, "app", &["a", "b"]);

        let (proj, changed) = sv.update_app(true, &opt).await;
        assert!(proj.is_some());
        assert!(changed.is_empty());
        assert_eq!(sv.proc_table.keys(), vec!["app::a", "app::b"]);
        assert_eq!(sv.proc_list.len(), 2);

        // Registering again is a no-op.
        let (proj2, _) = sv.update_app(true, &opt).await;
        assert!(proj2.is_some());
        assert_eq!(sv.proc_table.len(), 2);
    }

    #[tokio::test]
    async fn register_mode_requires_processes_and_workdir() {
        let tmp = TempDir::new().unwrap();
        let sv = Supervisor::new(BTreeMap::new(), false);

        let empty = ProcfileOption {
            app_name: "app".to_string(),
            work_dir: tmp.path().to_path_buf(),
            ..ProcfileOption::default()
        };
        let (proj, _) = sv.update_app(true, &empty).await;
        assert!(proj.is_none());
    }

    #[tokio::test]
    async fn update_mode_reconciles_declared_set() {
        let tmp = TempDir::new().unwrap();
        let sv = Supervisor::new(BTreeMap::new(), false);

        let initial = option_with(&tmp, "app", &["a", "b"]);
        sv.update_app(true, &initial).await;

        // `b` is flagged running and must survive the update even though
        // it stays declared; `a` is de-declared and goes away.
        let project = sv.get_project("app").unwrap();
        project.set_state("b", true);

        let rewritten = option_with(&tmp, "app", &["b", "c"]);
        let (proj, changed) = sv.update_app(false, &rewritten).await;
        assert!(proj.is_some());

        let changed_names: Vec<_> = changed.iter().map(|p| p.full_name.clone()).collect();
        assert_eq!(changed_names, vec!["app::c"]);

        assert!(sv.get_proc_by_name("app::a").is_none());
        assert!(sv.get_proc_by_name("app::b").is_some());
        assert!(sv.get_proc_by_name("app::c").is_some());
        assert_eq!(sv.proc_list.index("app::a"), None);
        assert!(sv.proc_list.index("app::c").is_some());
    }

    #[tokio::test]
    async fn update_mode_keeps_running_undeclared_processes() {
        let tmp = TempDir::new().unwrap();
        let sv = Supervisor::new(BTreeMap::new(), false);

        let initial = option_with(&tmp, "app", &["a", "b"]);
        sv.update_app(true, &initial).await;
        let project = sv.get_project("app").unwrap();
        project.set_state("a", true);

        let rewritten = option_with(&tmp, "app", &["b"]);
        sv.update_app(false, &rewritten).await;

        // Flagged-running `a` is not removed by reconfiguration.
        assert!(sv.get_proc_by_name("app::a").is_some());
    }

    #[tokio::test]
    async fn update_mode_on_unknown_project_is_none() {
        let tmp = TempDir::new().unwrap();
        let sv = Supervisor::new(BTreeMap::new(), false);
        let opt = option_with(&tmp, "app", &["a"]);
        let (proj, changed) = sv.update_app(false, &opt).await;
        assert!(proj.is_none());
        assert!(changed.is_empty());
    }
}
