use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command as StdCommand, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::sv::build_info;
use crate::sv::client;
use crate::sv::codec::ResponseMsg;
use crate::sv::config::{self, DaemonConfig};
use crate::sv::daemon;
use crate::sv::logging;

const DAEMON_READY_WAIT: Duration = Duration::from_secs(3);
const SHUTDOWN_REPLY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "spm", about = "spm cli", disable_version_flag = true)]
pub struct Args {
    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Set log level
    #[arg(short = 'l', long = "loglevel", default_value = "debug")]
    loglevel: String,

    /// The path to the work directory
    #[arg(short = 'w', long = "workdir")]
    workdir: Option<PathBuf>,

    /// The path to the Procfile
    #[arg(short = 'p', long = "procfile")]
    procfile: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Starts processes and/or the supervisor
    Start {
        processes: Vec<String>,
        /// Run the supervisor in the foreground
        #[arg(short = 'f', long = "foreground")]
        foreground: bool,
    },
    /// Stop processes
    Stop { processes: Vec<String> },
    /// Restart processes
    #[command(alias = "rs")]
    Restart { processes: Vec<String> },
    /// Check processes status
    Status { processes: Vec<String> },
    /// Run command as a process
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd_line: Vec<String>,
    },
    /// Reload processes and options
    Reload,
    /// Stop supervisor
    Shutdown,
    /// Run supervisor as a daemon
    Daemon {
        /// Run the supervisor in the foreground
        #[arg(short = 'f', long = "foreground")]
        foreground: bool,
    },
    /// Save all projects and processes for later resume
    #[command(alias = "save")]
    Dump,
    /// Load all project snapshots
    #[command(alias = "update")]
    Load,
    /// Print build info
    Version,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version {
        println!("{}", build_info::banner());
        return Ok(());
    }

    let workdir = match args.workdir.clone() {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => env::current_dir()?.join(dir),
        None => env::current_dir()?,
    };
    let procfile = args
        .procfile
        .clone()
        .unwrap_or_else(|| workdir.join("Procfile"));

    let cfg = config::load(&workdir)?;

    let Some(cmd) = args.cmd else {
        Args::command().print_help()?;
        return Ok(());
    };

    match cmd {
        Cmd::Version => {
            println!("{}", build_info::banner());
            Ok(())
        }
        Cmd::Daemon { foreground } => {
            if is_daemon_running(&cfg) {
                println!("Spm supervisor daemon is running. Don't start again.");
                return Ok(());
            }
            config::ensure_spm_home()?;
            logging::init_daemon(&args.loglevel, &cfg.log, foreground)?;
            println!("Supervisor is not running. Starting supervisor...\n");
            daemon::run(cfg, foreground)
        }
        Cmd::Start { processes, foreground } => {
            if foreground && !is_daemon_running(&cfg) {
                config::ensure_spm_home()?;
                logging::init_daemon(&args.loglevel, &cfg.log, true)?;
                spawn_after_start(&cfg, &workdir, &procfile, processes);
                return daemon::run(cfg, true);
            }

            logging::init_client(&args.loglevel);
            if !is_daemon_running(&cfg) {
                try_run_daemon(&workdir, &args.loglevel)?;
                wait_for_socket(&cfg.socket, DAEMON_READY_WAIT);
            }
            let resp = client::start(&cfg.socket, &workdir, &procfile, &processes)?;
            print_start(&resp);
            Ok(())
        }
        Cmd::Stop { processes } => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            let resp = client::stop(&cfg.socket, &workdir, &procfile, &processes)?;
            print_stop(&resp);
            Ok(())
        }
        Cmd::Restart { processes } => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            let resp = client::restart(&cfg.socket, &workdir, &procfile, &processes)?;
            print_restart(&resp);
            Ok(())
        }
        Cmd::Status { processes } => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            let resp = client::status(&cfg.socket, &workdir, &procfile, &processes)?;
            print_status(&resp);
            Ok(())
        }
        Cmd::Run { cmd_line } => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            if cmd_line.is_empty() {
                println!("usage: spm run <command> [args...]");
                return Ok(());
            }
            let resp = client::run(&cfg.socket, &workdir, &procfile, cmd_line)?;
            print_run(&resp);
            Ok(())
        }
        Cmd::Reload => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            let resp = client::reload(&cfg.socket, &workdir, &procfile)?;
            print_reload(&resp);
            Ok(())
        }
        Cmd::Dump => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            let resp = client::dump(&cfg.socket, &workdir, &procfile)?;
            print_header(&resp);
            Ok(())
        }
        Cmd::Load => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            let resp = client::load(&cfg.socket, &workdir, &procfile)?;
            print_header(&resp);
            Ok(())
        }
        Cmd::Shutdown => {
            logging::init_client(&args.loglevel);
            require_daemon_running(&cfg)?;
            // The daemon stops everything before replying; a late reply
            // is fine, the SIGQUIT below is the backstop.
            let _ = client::shutdown(&cfg.socket, &workdir, &procfile, SHUTDOWN_REPLY_WAIT);
            if let Ok(pid) = read_pid(&cfg.pidfile) {
                if pid > 0 {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGQUIT);
                }
            }
            println!("Supervisor service has been stopped.");
            Ok(())
        }
    }
}

fn read_pid(path: &Path) -> anyhow::Result<i32> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read pid file {}: {e}", path.display()))?;
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid pid file {}: {e}", path.display()))
}

fn is_daemon_running(cfg: &DaemonConfig) -> bool {
    match read_pid(&cfg.pidfile) {
        Ok(pid) if pid > 0 => kill(Pid::from_raw(pid), None).is_ok(),
        _ => false,
    }
}

fn require_daemon_running(cfg: &DaemonConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        is_daemon_running(cfg),
        "Supervisor has not started. Please check supervisor daemon."
    );
    Ok(())
}

/// Launch a detached `spm daemon` child; actual daemonization (setsid
/// and friends) is left to the platform around us.
fn try_run_daemon(workdir: &Path, loglevel: &str) -> anyhow::Result<()> {
    let exe = env::current_exe()?;
    StdCommand::new(exe)
        .arg("-w")
        .arg(workdir)
        .arg("-l")
        .arg(loglevel)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn spm daemon: {e}"))?;
    Ok(())
}

fn wait_for_socket(socket: &Path, limit: Duration) {
    let start = Instant::now();
    while start.elapsed() < limit {
        if socket.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Foreground `start`: once the in-process daemon is accepting, issue
/// the start request against it from a side thread.
fn spawn_after_start(cfg: &DaemonConfig, workdir: &Path, procfile: &Path, processes: Vec<String>) {
    let socket = cfg.socket.clone();
    let workdir = workdir.to_path_buf();
    let procfile = procfile.to_path_buf();
    thread::spawn(move || {
        wait_for_socket(&socket, DAEMON_READY_WAIT);
        match client::start(&socket, &workdir, &procfile, &processes) {
            Ok(resp) => print_start(&resp),
            Err(e) => eprintln!("ERROR: {e:#}"),
        }
    });
}

fn fmt_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn fmt_uptime(start_ms: i64, stop_ms: i64) -> String {
    let mut alive = if stop_ms == 0 && start_ms != 0 {
        Utc::now().timestamp_millis() - start_ms
    } else {
        stop_ms - start_ms
    };
    if start_ms == 0 || alive < 0 {
        alive = 0;
    }

    let hours = alive / 3_600_000;
    let mins = (alive / 60_000) % 60;
    let secs = (alive / 1_000) % 60;
    let ms = alive % 1_000;
    if hours >= 1 {
        format!("{hours}h:{mins}m:{secs}s.{ms}ms")
    } else if mins >= 1 {
        format!("{mins}m:{secs}s.{ms}ms")
    } else if alive >= 1_000 {
        format!("{secs}s.{ms}ms")
    } else {
        "0s".to_string()
    }
}

fn print_header(resp: &ResponseMsg) {
    println!("{}\t{}\n", resp.code, resp.message);
}

fn print_start(resp: &ResponseMsg) {
    let Some(procs) = resp.processes.as_ref().filter(|p| !p.is_empty()) else {
        println!("No processes to start.");
        return;
    };
    print_header(resp);
    for proc in procs {
        println!(
            "{} {}\t[PID {}] {}",
            fmt_ms(proc.start_at),
            proc.name,
            proc.pid,
            proc.status
        );
    }
}

fn print_stop(resp: &ResponseMsg) {
    let Some(procs) = resp.processes.as_ref().filter(|p| !p.is_empty()) else {
        println!("No processes to stop.");
        return;
    };
    print_header(resp);
    for proc in procs {
        println!(
            "[{}] {}\t[PID {}] {}",
            fmt_ms(proc.stop_at),
            proc.name,
            proc.pid,
            proc.status
        );
    }
}

fn print_restart(resp: &ResponseMsg) {
    let Some(procs) = resp.processes.as_ref().filter(|p| !p.is_empty()) else {
        println!("No processes to restart.");
        return;
    };
    print_header(resp);
    for proc in procs {
        println!("[{}] Restarted {}\t[PID {}]", fmt_ms(proc.start_at), proc.name, proc.pid);
    }
}

fn print_status(resp: &ResponseMsg) {
    let Some(procs) = resp.processes.as_ref().filter(|p| !p.is_empty()) else {
        println!("No processes found.");
        return;
    };
    print_header(resp);
    for proc in procs {
        println!(
            "Project: {}\tProcess: {}\t\tState: {}\t\tPID: {}\t\tUptime: {}",
            proc.project,
            proc.name,
            proc.status,
            proc.pid,
            fmt_uptime(proc.start_at, proc.stop_at)
        );
    }
}

fn print_run(resp: &ResponseMsg) {
    let Some(procs) = resp.processes.as_ref().filter(|p| !p.is_empty()) else {
        println!("No processes to run.");
        return;
    };
    let proc = &procs[0];
    println!("[{}] Run {}\t[PID {}]", fmt_ms(proc.start_at), proc.name, proc.pid);
}

fn print_reload(resp: &ResponseMsg) {
    let Some(procs) = resp.processes.as_ref().filter(|p| !p.is_empty()) else {
        println!("No processes changed");
        return;
    };
    print_header(resp);
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    for proc in procs {
        println!("[{now}] Load {}\t{}", proc.name, proc.status);
    }
}
