use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use spm::sv::client;
use spm::sv::codec::{Action, ActionMsg, ProcessState, ResponseMsg};

struct TestEnv {
    _tmp: TempDir,
    home: PathBuf,
    project: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let home = tmp.path().join("home");
        let project = tmp.path().join("project");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&project).unwrap();
        Self { _tmp: tmp, home, project }
    }

    fn spm_path() -> PathBuf {
        PathBuf::from(assert_cmd::cargo::cargo_bin!("spm"))
    }

    fn socket(&self) -> PathBuf {
        self.home.join(".spm").join("spm.sock")
    }

    fn pid_file(&self) -> PathBuf {
        self.home.join(".spm").join("spm.pid")
    }

    fn write_procfile(&self, content: &str) {
        fs::write(self.project.join("Procfile"), content).unwrap();
    }

    fn procfile(&self) -> PathBuf {
        self.project.join("Procfile")
    }

    fn cmd(&self) -> Command {
        let mut c = Command::new(Self::spm_path());
        c.env("HOME", &self.home);
        c.arg("-w");
        c.arg(&self.project);
        c
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut c = self.cmd();
        c.args(args);
        c.output().expect("run spm")
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let out = self.run(args);
        if !out.status.success() {
            panic!(
                "command failed {:?}\nstdout={}\nstderr={}",
                args,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        String::from_utf8_lossy(&out.stdout).to_string()
    }

    fn start_daemon(&self) -> DaemonGuard {
        let child = self
            .cmd()
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn spm daemon");
        self.wait_for(Duration::from_secs(5), || self.socket().exists());
        DaemonGuard { child }
    }

    fn wait_for<F: FnMut() -> bool>(&self, timeout: Duration, mut f: F) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        panic!("timeout waiting for condition");
    }

    fn status_star(&self) -> ResponseMsg {
        client::status(&self.socket(), &self.project, &self.procfile(), &[]).expect("status")
    }
}

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn happy_path_start_creates_pid_files() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\nworker: sleep 30\n");
    let _daemon = env.start_daemon();

    let resp =
        client::start(&env.socket(), &env.project, &env.procfile(), &[]).expect("start rpc");
    assert_eq!(resp.code, 200);
    let procs = resp.processes.expect("process list");
    assert_eq!(procs.len(), 2);

    let mut pids = std::collections::HashSet::new();
    for proc in &procs {
        assert_eq!(proc.status, ProcessState::Running);
        assert!(proc.pid > 0);
        assert!(proc.start_at > 0);
        pids.insert(proc.pid);
    }
    assert_eq!(pids.len(), 2);

    let web_pid_file = env.project.join("tmp").join("web.pid");
    let worker_pid_file = env.project.join("tmp").join("worker.pid");
    assert!(web_pid_file.exists());
    assert!(worker_pid_file.exists());

    let web = procs.iter().find(|p| p.name.ends_with("::web")).unwrap();
    let recorded: i32 = fs::read_to_string(&web_pid_file).unwrap().trim().parse().unwrap();
    assert_eq!(recorded, web.pid);

    let resp = client::stop(&env.socket(), &env.project, &env.procfile(), &[]).expect("stop rpc");
    assert_eq!(resp.code, 200);
}

#[test]
fn stop_is_idempotent() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\n");
    let _daemon = env.start_daemon();

    client::start(&env.socket(), &env.project, &env.procfile(), &[]).expect("start rpc");

    let stop_one = |name: &str| {
        client::stop(
            &env.socket(),
            &env.project,
            &env.procfile(),
            &[name.to_string()],
        )
        .expect("stop rpc")
    };

    let first = stop_one("web");
    let procs = first.processes.expect("stopped list");
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].status, ProcessState::Stopped);
    assert!(!env.project.join("tmp").join("web.pid").exists());

    let second = stop_one("web");
    let procs = second.processes.expect("stopped list");
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].status, ProcessState::Stopped);
}

#[test]
fn ignored_term_is_killed_after_grace() {
    let env = TestEnv::new();
    env.write_procfile("sleeper: sh -c \"trap '' TERM; sleep 60\"\n");
    let _daemon = env.start_daemon();

    client::start(&env.socket(), &env.project, &env.procfile(), &[]).expect("start rpc");

    let resp = client::stop(&env.socket(), &env.project, &env.procfile(), &[]).expect("stop rpc");
    let procs = resp.processes.expect("stopped list");
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].status, ProcessState::Stopped);
    // The child ignores TERM, so teardown spans the full grace window.
    assert!(
        procs[0].stop_at - procs[0].start_at >= 3_000,
        "expected >= 3s between start and stop, got {}ms",
        procs[0].stop_at - procs[0].start_at
    );
}

#[test]
fn reload_applies_procfile_changes() {
    let env = TestEnv::new();
    env.write_procfile("aa: sleep 30\nbb: sleep 30\n");
    let _daemon = env.start_daemon();

    // Status registers the project without starting anything.
    let resp = env.status_star();
    let names: Vec<String> = resp
        .processes
        .unwrap_or_default()
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert!(names.iter().any(|n| n.ends_with("::aa")));
    assert!(names.iter().any(|n| n.ends_with("::bb")));

    env.write_procfile("bb: sleep 30\ncc: sleep 30\n");
    let resp = client::reload(&env.socket(), &env.project, &env.procfile()).expect("reload rpc");
    assert_eq!(resp.code, 200);
    let changed = resp.processes.expect("changed list");
    assert_eq!(changed.len(), 1);
    assert!(changed[0].name.ends_with("::cc"));

    let after: Vec<String> = env
        .status_star()
        .processes
        .unwrap_or_default()
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert!(!after.iter().any(|n| n.ends_with("::aa")));
    assert!(after.iter().any(|n| n.ends_with("::bb")));
    assert!(after.iter().any(|n| n.ends_with("::cc")));
}

#[test]
fn run_registers_ad_hoc_command() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\n");
    let _daemon = env.start_daemon();

    let resp = client::run(
        &env.socket(),
        &env.project,
        &env.procfile(),
        vec!["/bin/echo".to_string(), "hi".to_string()],
    )
    .expect("run rpc");
    assert_eq!(resp.code, 200);
    let procs = resp.processes.expect("run result");
    assert_eq!(procs.len(), 1);
    assert!(procs[0].name.ends_with("::echo"));
    assert!(procs[0].pid > 0);

    // The one-shot command is observed Stopped shortly after.
    let name = procs[0].name.clone();
    env.wait_for(Duration::from_secs(5), || {
        env.status_star()
            .processes
            .unwrap_or_default()
            .iter()
            .any(|p| p.name == name && p.status == ProcessState::Stopped)
    });
}

#[test]
fn dump_then_load_restores_registry() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\nworker: sleep 30\n");

    let second_project = env.home.join("other");
    fs::create_dir_all(&second_project).unwrap();
    fs::write(second_project.join("Procfile"), "queue: sleep 30\ncron-job: sleep 30\n").unwrap();

    let expected: Vec<String> = {
        let _daemon = env.start_daemon();

        env.status_star();
        client::status(
            &env.socket(),
            &second_project,
            &second_project.join("Procfile"),
            &[],
        )
        .expect("status rpc");

        let mut names: Vec<String> = env
            .status_star()
            .processes
            .unwrap_or_default()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        assert_eq!(names.len(), 4);

        let resp = client::dump(&env.socket(), &env.project, &env.procfile()).expect("dump rpc");
        assert_eq!(resp.code, 200);

        let _ = client::shutdown(
            &env.socket(),
            &env.project,
            &env.procfile(),
            Duration::from_secs(5),
        );
        env.wait_for(Duration::from_secs(5), || !env.socket().exists());
        names
    };

    let _daemon = env.start_daemon();
    let resp = client::load(&env.socket(), &env.project, &env.procfile()).expect("load rpc");
    assert_eq!(resp.code, 200);

    let restored = env.status_star().processes.unwrap_or_default();
    let mut names: Vec<String> = restored.iter().map(|p| p.name.clone()).collect();
    names.sort();
    assert_eq!(names, expected);
    for proc in &restored {
        assert_eq!(proc.status, ProcessState::Standby);
        assert_eq!(proc.pid, 0);
    }
}

#[test]
fn shutdown_removes_daemon_files() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\n");
    let _daemon = env.start_daemon();
    assert!(env.pid_file().exists());

    let _ = client::shutdown(
        &env.socket(),
        &env.project,
        &env.procfile(),
        Duration::from_secs(5),
    );
    env.wait_for(Duration::from_secs(5), || {
        !env.socket().exists() && !env.pid_file().exists()
    });
}

#[test]
fn cli_surface_start_status_stop() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\n");
    let _daemon = env.start_daemon();

    let stdout = env.run_ok(&["start"]);
    assert!(stdout.contains("::web"), "stdout: {stdout}");
    assert!(stdout.contains("Running"), "stdout: {stdout}");

    let stdout = env.run_ok(&["status"]);
    assert!(stdout.contains("State: Running"), "stdout: {stdout}");
    assert!(stdout.contains("Uptime:"), "stdout: {stdout}");

    let stdout = env.run_ok(&["stop"]);
    assert!(stdout.contains("Stopped"), "stdout: {stdout}");

    // Empty result set prints the friendly line and still exits 0.
    let stdout = env.run_ok(&["run"]);
    assert!(stdout.contains("usage:"), "stdout: {stdout}");
}

#[test]
fn status_without_daemon_fails() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\n");
    let out = env.run(&["status"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Supervisor has not started"), "stderr: {stderr}");
}

#[test]
fn raw_wire_unknown_process_is_not_found() {
    let env = TestEnv::new();
    env.write_procfile("web: sleep 30\n");
    let _daemon = env.start_daemon();

    let msg = ActionMsg {
        action: Action::Status,
        work_dir: env.project.to_string_lossy().to_string(),
        procfile: env.procfile().to_string_lossy().to_string(),
        projects: None,
        processes: Some("ghost-app::nothing".to_string()),
        cmd_line: None,
    };
    let resp = client::call(&env.socket(), &msg).expect("raw call");
    assert_eq!(resp.code, 200);
    let procs = resp.processes.expect("sentinel list");
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].status, ProcessState::NotFound);
    assert_eq!(procs[0].name, "ghost-app::nothing");
}

#[test]
fn version_flag_prints_banner() {
    let env = TestEnv::new();
    let stdout = env.run_ok(&["version"]);
    assert!(stdout.contains("spm"), "stdout: {stdout}");
}
