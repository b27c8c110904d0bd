use std::collections::BTreeMap;
use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::sv::codec::{
    decode, encode, parse_selector, read_frame, write_frame, Action, ActionMsg, ProcInfo,
    ProcessState, ResponseCtl, ResponseMsg,
};
use crate::sv::config;
use crate::sv::options::{self, ProcessOption, ProcfileOption, DEFAULT_STOP_SIGNAL};
use crate::sv::project::{self, full_name, split_full_name};
use crate::sv::store;
use crate::sv::supervisor::Supervisor;

/// One client connection: read a single request frame, dispatch it,
/// write a single response frame. The returned control code tells the
/// accept loop whether the daemon should keep serving.
pub struct Session<S> {
    sv: Arc<Supervisor>,
    stream: S,
    dump_path: PathBuf,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(sv: Arc<Supervisor>, stream: S, dump_path: PathBuf) -> Self {
        Self { sv, stream, dump_path }
    }

    pub async fn handle(mut self) -> ResponseCtl {
        let msg = match self.read_request().await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("session request error: {e:#}");
                return self.send(ResponseMsg::error(500, e.to_string()), ResponseCtl::MsgErr).await;
            }
        };
        self.dispatch(msg).await
    }

    async fn read_request(&mut self) -> anyhow::Result<ActionMsg> {
        let body = read_frame(&mut self.stream).await?;
        decode(&body)
    }

    async fn dispatch(mut self, msg: ActionMsg) -> ResponseCtl {
        match msg.action {
            Action::Kill | Action::Shutdown => {
                // Prepare the response, then bring everything down; the
                // client has its own timeout in case we never answer.
                let res = ResponseMsg::ok("Shutdown prepared");
                self.sv.shutdown().await;
                self.send(res, ResponseCtl::Shutdown).await
            }
            Action::Log => {
                self.send(
                    ResponseMsg::error(404, "Feature not implemented"),
                    ResponseCtl::MsgErr,
                )
                .await
            }
            Action::Run => {
                let res = self.do_run(&msg).await;
                self.send(res, ResponseCtl::Normal).await
            }
            Action::Reload => {
                let res = self.do_reload(&msg).await;
                self.send(res, ResponseCtl::Reload).await
            }
            Action::Dump => {
                let res = match store::dump(&self.sv, &self.dump_path) {
                    Ok(()) => ResponseMsg::ok("Save project list Successfully"),
                    Err(e) => {
                        tracing::error!("dump failed: {e:#}");
                        ResponseMsg::error(500, e.to_string())
                    }
                };
                self.send(res, ResponseCtl::Normal).await
            }
            Action::Load => {
                let res = match store::load(&self.sv, &self.dump_path).await {
                    Ok(()) => ResponseMsg::ok("Load project list Successfully"),
                    Err(e) => {
                        tracing::error!("load failed: {e:#}");
                        ResponseMsg::error(500, e.to_string())
                    }
                };
                self.send(res, ResponseCtl::Normal).await
            }
            Action::Start | Action::Stop | Action::Status | Action::Restart => {
                let res = self.do_action(&msg).await;
                self.send(res, ResponseCtl::Normal).await
            }
        }
    }

    async fn send(&mut self, res: ResponseMsg, ctl: ResponseCtl) -> ResponseCtl {
        let body = match encode(&res) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("response encode error: {e:#}");
                return ResponseCtl::MsgErr;
            }
        };
        if let Err(e) = write_frame(&mut self.stream, &body).await {
            tracing::error!("response write error: {e:#}");
            return ResponseCtl::MsgErr;
        }
        ctl
    }

    /// Start/Stop/Restart/Status: parse the selector, group names by app
    /// (bare names resolve in the caller's work-directory project) and
    /// hand each group to the batch dispatcher.
    async fn do_action(&self, msg: &ActionMsg) -> ResponseMsg {
        let selector = match msg.processes.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => "*".to_string(),
        };

        let mut proc_map: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut local: Vec<String> = Vec::new();
        for entry in parse_selector(&selector) {
            if entry.contains("::") {
                let (app, _) = split_full_name(&entry);
                proc_map.entry(app.to_string()).or_default().push(entry);
            } else {
                local.push(entry);
            }
        }

        let mut loaded: Option<ProcfileOption> = None;
        if !local.is_empty() {
            let opt = match options::load_procfile_option(
                Path::new(&msg.work_dir),
                Path::new(&msg.procfile),
                self.sv.global_env(),
            ) {
                Ok(opt) => opt,
                Err(e) => {
                    tracing::error!("{e:#}");
                    return ResponseMsg::error(500, "Load procfile options failed.");
                }
            };
            let names = if local[0] == "*" {
                local
            } else {
                local
                    .into_iter()
                    .map(|n| full_name(&opt.app_name, &n))
                    .collect()
            };
            proc_map.insert(opt.app_name.clone(), names);
            loaded = Some(opt);
        }

        let mut infos: Vec<ProcInfo> = Vec::new();
        for (app, procs) in proc_map.iter() {
            let opt = if self.sv.get_project(app).is_some() {
                ProcfileOption::named(app.clone())
            } else {
                match &loaded {
                    Some(opt) if &opt.app_name == app => opt.clone(),
                    _ => ProcfileOption::named(app.clone()),
                }
            };

            match self.sv.batch_do(msg.action, &opt, procs).await {
                Some(batch) => infos.extend(batch),
                None => {
                    // Unknown project: answer with NotFound sentinels so a
                    // batch never short-circuits the whole request.
                    for name in procs.iter().filter(|n| n.as_str() != "*") {
                        let (project, _) = split_full_name(name);
                        infos.push(ProcInfo {
                            pid: 0,
                            name: name.clone(),
                            project: project.to_string(),
                            start_at: 0,
                            stop_at: 0,
                            status: ProcessState::NotFound,
                        });
                    }
                }
            }
        }

        ResponseMsg::with_processes(msg.action.response_message(), infos)
    }

    /// Register an ad-hoc command as a managed process under the app
    /// identity of the request's work directory, then start it.
    async fn do_run(&self, msg: &ActionMsg) -> ResponseMsg {
        let Some(cmd_line) = msg.cmd_line.as_ref().filter(|c| !c.is_empty()) else {
            return ResponseMsg::error(500, "empty command line");
        };

        let exe_path = match lookup_path(&cmd_line[0]) {
            Some(path) => path,
            None => {
                return ResponseMsg::error(
                    500,
                    format!("{}: executable file not found in $PATH", cmd_line[0]),
                )
            }
        };

        let work_dir = PathBuf::from(&msg.work_dir);
        let app_name = match project::app_name(&work_dir) {
            Ok(name) => name,
            Err(e) => return ResponseMsg::error(500, e.to_string()),
        };
        let runtime = match config::runtime_dir(&work_dir) {
            Ok(dir) => dir,
            Err(e) => return ResponseMsg::error(500, e.to_string()),
        };

        let proc_name = exe_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| cmd_line[0].clone());

        let mut argv = vec![exe_path.to_string_lossy().to_string()];
        argv.extend(cmd_line[1..].iter().cloned());

        let mut processes = IndexMap::new();
        processes.insert(
            proc_name.clone(),
            ProcessOption {
                root: work_dir.clone(),
                pid_root: runtime.clone(),
                log_root: runtime,
                stop_signal: DEFAULT_STOP_SIGNAL.to_string(),
                num_procs: 1,
                env: BTreeMap::new(),
                cmd: argv,
            },
        );
        let opt = ProcfileOption {
            app_name: app_name.clone(),
            work_dir,
            procfile: PathBuf::from(&msg.procfile),
            env: BTreeMap::new(),
            processes,
        };

        // Register the project, then reconcile so an existing project
        // picks the ad-hoc process up too.
        let _ = self.sv.update_app(true, &opt).await;
        let _ = self.sv.update_app(false, &opt).await;

        let full = full_name(&app_name, &proc_name);
        match self.sv.batch_do(Action::Start, &opt, &[full]).await {
            Some(infos) => ResponseMsg::with_processes(Action::Run.response_message(), infos),
            None => ResponseMsg::error(500, "Run command failed"),
        }
    }

    /// Reconcile the declared process set against the live registry and
    /// answer with the processes that changed.
    async fn do_reload(&self, msg: &ActionMsg) -> ResponseMsg {
        let mut opts: Vec<ProcfileOption> = Vec::new();

        match msg.projects.as_deref().filter(|p| !p.is_empty()) {
            Some(projects) => {
                for name in projects.split(';').filter(|p| !p.is_empty()) {
                    opts.push(ProcfileOption::named(name));
                }
            }
            None => {
                if !msg.work_dir.is_empty() && !msg.procfile.is_empty() {
                    match options::load_procfile_option(
                        Path::new(&msg.work_dir),
                        Path::new(&msg.procfile),
                        self.sv.global_env(),
                    ) {
                        Ok(opt) => opts.push(opt),
                        Err(e) => tracing::error!("{e:#}"),
                    }
                }
            }
        }

        let mut changed_total = Vec::new();
        for opt in &opts {
            let (project, changed) = self.sv.update_app(false, opt).await;
            if project.is_none() {
                tracing::error!("cannot find project {}", opt.app_name);
                return ResponseMsg::error(500, "Reload failed");
            }
            changed_total.extend(changed);
        }

        let infos: Vec<ProcInfo> = changed_total.iter().map(|p| p.proc_info(None)).collect();
        ResponseMsg::with_processes(Action::Reload.response_message(), infos)
    }
}

/// Resolve an executable the way a shell would: explicit paths are
/// checked directly, bare names are searched along $PATH.
pub fn lookup_path(exe: &str) -> Option<PathBuf> {
    fn is_executable(path: &Path) -> bool {
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    if exe.contains('/') {
        let path = PathBuf::from(exe);
        return is_executable(&path).then_some(path);
    }

    let paths = env::var_os("PATH")?;
    for dir in env::split_paths(&paths) {
        let candidate = dir.join(exe);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}
