use std::sync::Arc;

use crate::sv::codec::{Action, ProcInfo, ProcessState};
use crate::sv::options::ProcfileOption;
use crate::sv::process::Process;
use crate::sv::project::split_full_name;
use crate::sv::supervisor::Supervisor;

/// Result of a single-process operation. `NotFound` is the sentinel for
/// actions on names the registry does not know.
pub enum OpResult {
    Proc { proc: Arc<Process>, status: ProcessState },
    NotFound { name: String },
}

impl OpResult {
    pub fn proc_info(&self) -> ProcInfo {
        match self {
            OpResult::Proc { proc, status } => proc.proc_info(Some(*status)),
            OpResult::NotFound { name } => {
                let (project, _) = split_full_name(name);
                ProcInfo {
                    pid: 0,
                    name: name.clone(),
                    project: project.to_string(),
                    start_at: 0,
                    stop_at: 0,
                    status: ProcessState::NotFound,
                }
            }
        }
    }

    pub fn status(&self) -> ProcessState {
        match self {
            OpResult::Proc { status, .. } => *status,
            OpResult::NotFound { .. } => ProcessState::NotFound,
        }
    }
}

impl Supervisor {
    /// Start one process by full name. An already-running process is
    /// reported with the transient `Started` ACK; this is also what a
    /// second concurrent caller observes after the lock is released.
    pub async fn start(&self, name: &str) -> OpResult {
        let _guard = self.op_lock.lock().await;

        let Some(proc) = self.get_proc_by_name(name) else {
            return OpResult::NotFound { name: name.to_string() };
        };
        let (app, short) = split_full_name(name);
        let project = self.get_project(app);

        if proc.is_running() {
            tracing::warn!("{} already running with PID {}", proc.full_name, proc.pid());
            if let Some(project) = &project {
                project.set_state(short, true);
            }
            return OpResult::Proc { proc, status: ProcessState::Started };
        }

        let ok = proc.start();
        if let Some(project) = &project {
            project.set_state(short, ok);
        }
        let status = if ok { proc.current_state() } else { ProcessState::Failed };
        OpResult::Proc { proc, status }
    }

    /// Stop one process by full name. Stopping a stopped process is a
    /// no-op success; a process whose intended-running flag is off is
    /// reported in its current state without being signalled.
    pub async fn stop(&self, name: &str) -> OpResult {
        let _guard = self.op_lock.lock().await;

        let Some(proc) = self.get_proc_by_name(name) else {
            return OpResult::NotFound { name: name.to_string() };
        };
        let (app, short) = split_full_name(name);
        let project = self.get_project(app);

        if proc.current_state() == ProcessState::Stopped {
            tracing::info!("{} is stopped", proc.full_name);
            if let Some(project) = &project {
                project.set_state(short, false);
            }
            return OpResult::Proc { proc, status: ProcessState::Stopped };
        }

        let flagged = project.as_ref().map(|p| p.get_state(short)).unwrap_or(false);
        if flagged && proc.stop().await {
            if let Some(project) = &project {
                project.set_state(short, false);
            }
            return OpResult::Proc { proc, status: ProcessState::Stopped };
        }

        let status = proc.current_state();
        OpResult::Proc { proc, status }
    }

    pub async fn restart(&self, name: &str) -> OpResult {
        let _ = self.stop(name).await;
        self.start(name).await
    }

    /// Current state without mutating anything except the project flag,
    /// which is refreshed when the process is observed alive.
    pub async fn status(&self, name: &str) -> OpResult {
        let _guard = self.op_lock.lock().await;

        let Some(proc) = self.get_proc_by_name(name) else {
            return OpResult::NotFound { name: name.to_string() };
        };
        let (app, short) = split_full_name(name);
        if proc.is_running() {
            if let Some(project) = self.get_project(app) {
                project.set_state(short, true);
            }
        }
        let status = proc.current_state();
        OpResult::Proc { proc, status }
    }

    /// Key snapshot for a batch scope: the whole table in insertion order
    /// for `*`, otherwise the project's declared names.
    fn scoped_names(&self, app: &str) -> Vec<String> {
        if app == "*" {
            return self.proc_table.keys();
        }
        match self.get_project(app) {
            Some(project) => project
                .proc_names()
                .into_iter()
                .map(|n| crate::sv::project::full_name(app, &n))
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn start_all(&self, app: &str) -> Vec<OpResult> {
        let mut out = Vec::new();
        for name in self.scoped_names(app) {
            out.push(self.start(&name).await);
        }
        out
    }

    /// Stop a scope. For a named app, processes whose intended-running
    /// flag is off are skipped; for `*`, already-stopped processes are.
    pub async fn stop_all(&self, app: &str) -> Vec<OpResult> {
        let mut out = Vec::new();
        if app == "*" {
            for name in self.scoped_names(app) {
                if let Some(proc) = self.get_proc_by_name(&name) {
                    if proc.current_state() == ProcessState::Stopped {
                        continue;
                    }
                }
                out.push(self.stop(&name).await);
            }
            return out;
        }

        let Some(project) = self.get_project(app) else {
            return out;
        };
        for short in project.proc_names() {
            if !project.get_state(&short) {
                continue;
            }
            let full = crate::sv::project::full_name(app, &short);
            out.push(self.stop(&full).await);
        }
        out
    }

    pub async fn restart_all(&self, app: &str) -> Vec<OpResult> {
        let mut out = Vec::new();
        for name in self.scoped_names(app) {
            out.push(self.restart(&name).await);
        }
        out
    }

    pub async fn status_all(&self, app: &str) -> Vec<OpResult> {
        let mut out = Vec::new();
        for name in self.scoped_names(app) {
            out.push(self.status(&name).await);
        }
        out
    }

    /// Entry point for action handling: make sure the target project is
    /// registered, run the single or `*`-scoped operation, and project
    /// each result into a wire snapshot. Per-process failures become
    /// snapshots; a missing project is the only way to get None.
    pub async fn batch_do(
        &self,
        action: Action,
        opt: &ProcfileOption,
        procs: &[String],
    ) -> Option<Vec<ProcInfo>> {
        let (project, _) = self.update_app(true, opt).await;
        if project.is_none() && self.get_project(&opt.app_name).is_none() {
            tracing::error!("cannot find project in work directory {}", opt.work_dir.display());
            return None;
        }

        let results = if procs.iter().any(|p| p == "*") {
            match action {
                Action::Start => self.start_all("*").await,
                Action::Stop => self.stop_all("*").await,
                Action::Restart => self.restart_all("*").await,
                Action::Status => self.status_all("*").await,
                _ => Vec::new(),
            }
        } else {
            let mut out = Vec::new();
            for name in procs {
                let result = match action {
                    Action::Start => self.start(name).await,
                    Action::Stop => self.stop(name).await,
                    Action::Restart => self.restart(name).await,
                    Action::Status => self.status(name).await,
                    _ => continue,
                };
                out.push(result);
            }
            out
        };

        Some(results.iter().map(OpResult::proc_info).collect())
    }
}
