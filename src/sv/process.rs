use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::sv::codec::{ProcInfo, ProcessState};
use crate::sv::config;
use crate::sv::options::{ProcessOption, DEFAULT_STOP_SIGNAL};
use crate::sv::project::split_full_name;

/// How long a cancelled child gets to exit on its own before the stop
/// signal is delivered to its process group.
const GRACEFUL_WAIT: Duration = Duration::from_secs(3);
/// How long the stop signal gets to land before escalating to SIGKILL.
const SIGNAL_WAIT: Duration = Duration::from_secs(1);
/// SIGKILL cannot be ignored; this bounds the monitor wait regardless.
const KILL_WAIT: Duration = Duration::from_secs(5);

pub fn parse_stop_signal(name: &str) -> Signal {
    let raw = name.trim().to_uppercase();
    let bare = raw.strip_prefix("SIG").unwrap_or(&raw);
    match bare {
        "INT" => Signal::SIGINT,
        "TERM" => Signal::SIGTERM,
        "QUIT" => Signal::SIGQUIT,
        "STOP" => Signal::SIGSTOP,
        "ABRT" | "ABORT" => Signal::SIGABRT,
        other => {
            if other != DEFAULT_STOP_SIGNAL {
                tracing::warn!("unknown stop signal {name:?}; defaulting to {DEFAULT_STOP_SIGNAL}");
            }
            Signal::SIGTERM
        }
    }
}

#[derive(Debug)]
struct ProcState {
    pid: i32,
    pid_path: PathBuf,
    start_at: Option<DateTime<Utc>>,
    stop_at: Option<DateTime<Utc>>,
    state: ProcessState,
    /// True once a spawn has succeeded since registration; a process that
    /// never launched stays Standby.
    spawned: bool,
    cancel: Option<watch::Sender<bool>>,
    alive_rx: Option<watch::Receiver<bool>>,
    readers: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

/// Clear per-run residue: the pid file and the recorded pid.
fn on_stop_locked(st: &mut ProcState, full_name: &str, name: &str) {
    st.pid = 0;
    if st.pid_path.as_os_str().is_empty() {
        return;
    }
    match fs::remove_file(&st.pid_path) {
        Ok(()) => tracing::debug!(proc = %full_name, "removed {name} PID file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!(proc = %full_name, "failed to remove pid file: {e}"),
    }
}

/// One supervised child process: spawn, monitor, signal, terminate, and
/// tee its output into per-process log files.
#[derive(Debug)]
pub struct Process {
    pub name: String,
    pub full_name: String,
    pub out_log: PathBuf,
    pub err_log: PathBuf,
    opts: ProcessOption,
    signal: Signal,
    foreground: bool,
    state: Arc<Mutex<ProcState>>,
}

impl Process {
    pub fn new(full_name: &str, opts: ProcessOption, foreground: bool) -> Self {
        let (_, name) = split_full_name(full_name);
        let signal = parse_stop_signal(&opts.stop_signal);
        let out_log = opts.log_root.join(format!("{name}_output.log"));
        let err_log = opts.log_root.join(format!("{name}_error.log"));

        Self {
            name: name.to_string(),
            full_name: full_name.to_string(),
            out_log,
            err_log,
            opts,
            signal,
            foreground,
            state: Arc::new(Mutex::new(ProcState {
                pid: 0,
                pid_path: PathBuf::new(),
                start_at: None,
                stop_at: None,
                state: ProcessState::Standby,
                spawned: false,
                cancel: None,
                alive_rx: None,
                readers: Vec::new(),
                monitor: None,
            })),
        }
    }

    pub fn options(&self) -> &ProcessOption {
        &self.opts
    }

    fn lock(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pid(&self) -> i32 {
        self.lock().pid
    }

    pub fn current_state(&self) -> ProcessState {
        self.lock().state
    }

    /// Wire snapshot; `status` overrides the observed state when the
    /// operations layer wants to report a transient ACK.
    pub fn proc_info(&self, status: Option<ProcessState>) -> ProcInfo {
        let st = self.lock();
        let (project, _) = split_full_name(&self.full_name);
        ProcInfo {
            pid: st.pid,
            name: self.full_name.clone(),
            project: project.to_string(),
            start_at: st.start_at.map(|t| t.timestamp_millis()).unwrap_or(0),
            stop_at: st.stop_at.map(|t| t.timestamp_millis()).unwrap_or(0),
            status: status.unwrap_or(st.state),
        }
    }

    /// Liveness probe via signal 0. Both ESRCH and EPERM count as dead
    /// for our purposes. Updates the recorded state as a side effect.
    pub fn is_running(&self) -> bool {
        let mut st = self.lock();
        self.is_running_locked(&mut st)
    }

    fn is_running_locked(&self, st: &mut ProcState) -> bool {
        if !st.spawned {
            st.state = ProcessState::Standby;
            return false;
        }
        if st.pid <= 0 {
            return st.state == ProcessState::Running;
        }
        match kill(Pid::from_raw(st.pid), None) {
            Ok(()) => {
                st.state = ProcessState::Running;
                true
            }
            Err(_) => {
                st.state = ProcessState::Stopped;
                false
            }
        }
    }

    /// Spawn the child. Returns true when the process is running on
    /// return (including the already-running case); failures are logged
    /// and leave the process in the Failed state.
    pub fn start(&self) -> bool {
        match self.try_start() {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(proc = %self.full_name, "start failed: {e:#}");
                let mut st = self.lock();
                st.state = ProcessState::Failed;
                false
            }
        }
    }

    fn try_start(&self) -> anyhow::Result<bool> {
        let mut st = self.lock();

        if st.state == ProcessState::Stopping {
            tracing::warn!(proc = %self.full_name, "process is stopping, cannot be started again");
            return Ok(false);
        }
        if self.is_running_locked(&mut st) {
            tracing::warn!(proc = %self.full_name, "already running with PID {}", st.pid);
            return Ok(true);
        }

        // Log sinks are reopened on every start. Both must succeed.
        if !self.opts.log_root.as_os_str().is_empty() {
            fs::create_dir_all(&self.opts.log_root).map_err(|e| {
                anyhow::anyhow!("cannot open log files: {}: {e}", self.opts.log_root.display())
            })?;
        }
        let out_file = open_append(&self.out_log)
            .map_err(|e| anyhow::anyhow!("cannot open log files: {e}"))?;
        let err_file = match open_append(&self.err_log) {
            Ok(f) => f,
            Err(e) => {
                drop(out_file);
                anyhow::bail!("cannot open log files: {e}");
            }
        };

        anyhow::ensure!(
            self.opts.root.is_dir(),
            "cannot change to working directory {}",
            self.opts.root.display()
        );
        anyhow::ensure!(!self.opts.cmd.is_empty(), "command is empty");

        st.pid_path = self.resolve_pid_path()?;

        let mut cmd = Command::new(&self.opts.cmd[0]);
        cmd.args(&self.opts.cmd[1..])
            .current_dir(&self.opts.root)
            .envs(self.opts.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // The child gets its own process group so stop signals reach the
        // whole tree via kill(-pid).
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn process: {e}"))?;
        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Pid, timestamps and state become visible before any task that
        // could observe the child's termination is spawned.
        st.pid = pid;
        st.start_at = Some(Utc::now());
        st.stop_at = None;
        st.state = ProcessState::Running;
        st.spawned = true;

        if let Err(e) = write_pid_file(&st.pid_path, pid) {
            tracing::error!(proc = %self.full_name, "{e:#}");
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (alive_tx, alive_rx) = watch::channel(true);
        st.cancel = Some(cancel_tx);
        st.alive_rx = Some(alive_rx);

        st.readers.clear();
        if let Some(pipe) = stdout {
            st.readers
                .push(self.spawn_reader("STDOUT", pipe, out_file, cancel_rx.clone()));
        }
        if let Some(pipe) = stderr {
            st.readers
                .push(self.spawn_reader("STDERR", pipe, err_file, cancel_rx));
        }
        st.monitor = Some(self.spawn_monitor(child, alive_tx));

        tracing::info!(proc = %self.full_name, "process {} is started with PID {pid}", self.name);
        Ok(true)
    }

    fn resolve_pid_path(&self) -> anyhow::Result<PathBuf> {
        let mut path = config::runtime_dir(&self.opts.root)?.join(format!("{}.pid", self.name));
        if !self.opts.pid_root.as_os_str().is_empty() {
            if let Ok(meta) = fs::metadata(&self.opts.pid_root) {
                if meta.is_dir() {
                    path = self.opts.pid_root.join(format!("{}.pid", self.name));
                }
            }
        }
        Ok(path)
    }

    fn spawn_reader<R>(
        &self,
        stream: &'static str,
        pipe: R,
        file: fs::File,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let full_name = self.full_name.clone();
        let foreground = self.foreground;
        tokio::spawn(async move {
            let mut dest = tokio::fs::File::from_std(file);
            let mut lines = BufReader::new(pipe).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Err(e) = dest.write_all(line.as_bytes()).await {
                                tracing::warn!(proc = %full_name, "{stream} log write error: {e}");
                                break;
                            }
                            if let Err(e) = dest.write_all(b"\n").await {
                                tracing::warn!(proc = %full_name, "{stream} log write error: {e}");
                                break;
                            }
                            if foreground {
                                if stream == "STDERR" {
                                    eprintln!("{line}");
                                } else {
                                    println!("{line}");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(proc = %full_name, "{stream} pipe read error: {e}");
                            break;
                        }
                    },
                    _ = cancel.changed() => break,
                }
            }
            let _ = dest.flush().await;
            tracing::debug!(proc = %full_name, "{stream} logging finished");
        })
    }

    fn spawn_monitor(&self, mut child: Child, alive_tx: watch::Sender<bool>) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let full_name = self.full_name.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => match status.code() {
                    Some(code) => {
                        tracing::info!(proc = %full_name, "process {name} exited with code={code}")
                    }
                    None => {
                        tracing::info!(proc = %full_name, "process {name} terminated by signal")
                    }
                },
                Err(e) => tracing::error!(proc = %full_name, "wait failed: {e}"),
            }

            let mut st = state.lock().unwrap_or_else(|p| p.into_inner());
            on_stop_locked(&mut st, &full_name, &name);
            st.stop_at = Some(Utc::now());
            st.state = ProcessState::Stopped;
            drop(st);
            let _ = alive_tx.send(false);
        })
    }

    /// Re-read the pid file; an externally rewritten file adopts the new
    /// pid. Returns false when the file is missing or unreadable.
    pub fn update_pid(&self) -> bool {
        let mut st = self.lock();
        if st.pid_path.as_os_str().is_empty() {
            return false;
        }
        let raw = match fs::read_to_string(&st.pid_path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(proc = %self.full_name, "failed to read pid file: {e}");
                }
                return false;
            }
        };
        let pid: i32 = match raw.trim().parse() {
            Ok(pid) => pid,
            Err(e) => {
                tracing::error!(proc = %self.full_name, "invalid pid file content: {e}");
                return false;
            }
        };
        if pid > 0 && pid != st.pid {
            let mtime = fs::metadata(&st.pid_path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from);
            match mtime {
                Ok(t) => st.start_at = Some(t),
                Err(e) => {
                    tracing::error!(proc = %self.full_name, "failed to stat pid file: {e}");
                    return false;
                }
            }
            st.pid = pid;
            tracing::debug!(proc = %self.full_name, "PID file changed, updated pid to {pid}");
        }
        true
    }

    /// Graceful-then-forceful termination of the whole process group.
    /// Idempotent on already-stopped processes; returns true iff the
    /// terminal state is Stopped.
    pub async fn stop(&self) -> bool {
        if self.is_running() && !self.update_pid() {
            let mut st = self.lock();
            st.state = ProcessState::Unknown;
        }

        let (state_now, pid) = {
            let st = self.lock();
            (st.state, st.pid)
        };

        match state_now {
            ProcessState::Running => self.stop_running(pid).await,
            ProcessState::Stopped => {
                tracing::info!(proc = %self.full_name, "process {} already stopped", self.name);
                true
            }
            other => {
                tracing::info!(proc = %self.full_name, "process {} status is {other}", self.name);
                other == ProcessState::Stopped
            }
        }
    }

    async fn stop_running(&self, pid: i32) -> bool {
        let (cancel, alive_rx, readers) = {
            let mut st = self.lock();
            st.state = ProcessState::Stopping;
            (st.cancel.take(), st.alive_rx.clone(), std::mem::take(&mut st.readers))
        };

        // Drain the readers first; dropping the pipe ends also surfaces
        // EPIPE to a chatty child, which helps it exit on its own.
        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
        }
        for reader in readers {
            let _ = reader.await;
        }

        match alive_rx {
            Some(mut alive) => {
                let graceful = timeout(GRACEFUL_WAIT, alive.wait_for(|a| !*a)).await.is_ok();
                if graceful {
                    tracing::info!(proc = %self.full_name, "process {} exited gracefully", self.name);
                } else {
                    tracing::info!(proc = %self.full_name, "sending {:?} to PID {pid}", self.signal);
                    match kill(Pid::from_raw(-pid), self.signal) {
                        Ok(()) | Err(Errno::ESRCH) => {
                            let landed =
                                timeout(SIGNAL_WAIT, alive.wait_for(|a| !*a)).await.is_ok();
                            if !landed {
                                tracing::warn!(proc = %self.full_name, "force kill process {}", self.name);
                                let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(proc = %self.full_name, "force kill process {} after signal error: {e}", self.name);
                            let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
                        }
                    }
                    let _ = timeout(KILL_WAIT, alive.wait_for(|a| !*a)).await;
                }
            }
            None => {
                // No monitor to coordinate with; fall straight through to
                // signalling the group.
                tracing::info!(proc = %self.full_name, "sending {:?} to PID {pid}", self.signal);
                if let Err(e) = kill(Pid::from_raw(-pid), self.signal) {
                    if e != Errno::ESRCH {
                        tracing::warn!(proc = %self.full_name, "force kill process {} after signal error: {e}", self.name);
                        let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
                    }
                }
            }
        }

        let monitor = {
            let mut st = self.lock();
            st.monitor.take()
        };
        if let Some(monitor) = monitor {
            let _ = timeout(SIGNAL_WAIT, monitor).await;
        }

        let mut st = self.lock();
        on_stop_locked(&mut st, &self.full_name, &self.name);
        if st.stop_at.is_none() {
            st.stop_at = Some(Utc::now());
        }
        st.state = ProcessState::Stopped;
        st.state == ProcessState::Stopped
    }

    /// Stop (if needed) then start. The pid is reset to 0 in between.
    pub async fn restart(&self) -> bool {
        let _ = self.update_pid();
        if self.is_running() {
            let _ = self.stop().await;
        } else {
            tracing::info!(proc = %self.full_name, "process {} is not running, starting it", self.name);
            let mut st = self.lock();
            on_stop_locked(&mut st, &self.full_name, &self.name);
        }

        {
            let mut st = self.lock();
            st.pid = 0;
        }
        self.start()
    }
}

fn open_append(path: &std::path::Path) -> std::io::Result<fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
}

fn write_pid_file(path: &std::path::Path, pid: i32) -> anyhow::Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open pid file {}: {e}", path.display()))?;
    use std::io::Write as _;
    f.write_all(pid.to_string().as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to write pid file {}: {e}", path.display()))?;
    Ok(())
}
