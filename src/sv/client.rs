use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::sv::codec::{
    decode, encode, read_frame_sync, write_frame_sync, Action, ActionMsg, ResponseMsg,
};

/// One request, one response over the daemon's control socket.
pub fn call(socket: &Path, msg: &ActionMsg) -> anyhow::Result<ResponseMsg> {
    call_with_timeout(socket, msg, None)
}

pub fn call_with_timeout(
    socket: &Path,
    msg: &ActionMsg,
    read_timeout: Option<Duration>,
) -> anyhow::Result<ResponseMsg> {
    let mut stream = UnixStream::connect(socket).map_err(|e| {
        anyhow::anyhow!("failed to connect to spm daemon socket {}: {e}", socket.display())
    })?;
    if read_timeout.is_some() {
        stream.set_read_timeout(read_timeout)?;
    }

    let body = encode(msg)?;
    write_frame_sync(&mut stream, &body)?;

    let resp = read_frame_sync(&mut stream)?;
    decode(&resp)
}

/// Selector rules: no names means everything, one name stays bare,
/// several are joined with `;`.
fn join_processes(processes: &[String]) -> String {
    match processes.len() {
        0 => "*".to_string(),
        1 => processes[0].clone(),
        _ => processes.join(";"),
    }
}

fn action_msg(action: Action, work_dir: &Path, procfile: &Path, processes: &[String]) -> ActionMsg {
    ActionMsg {
        action,
        work_dir: work_dir.to_string_lossy().to_string(),
        procfile: procfile.to_string_lossy().to_string(),
        projects: None,
        processes: Some(join_processes(processes)),
        cmd_line: None,
    }
}

fn plain_msg(action: Action, work_dir: &Path, procfile: &Path) -> ActionMsg {
    ActionMsg {
        action,
        work_dir: work_dir.to_string_lossy().to_string(),
        procfile: procfile.to_string_lossy().to_string(),
        projects: None,
        processes: None,
        cmd_line: None,
    }
}

pub fn start(
    socket: &Path,
    work_dir: &Path,
    procfile: &Path,
    processes: &[String],
) -> anyhow::Result<ResponseMsg> {
    call(socket, &action_msg(Action::Start, work_dir, procfile, processes))
}

pub fn stop(
    socket: &Path,
    work_dir: &Path,
    procfile: &Path,
    processes: &[String],
) -> anyhow::Result<ResponseMsg> {
    call(socket, &action_msg(Action::Stop, work_dir, procfile, processes))
}

pub fn restart(
    socket: &Path,
    work_dir: &Path,
    procfile: &Path,
    processes: &[String],
) -> anyhow::Result<ResponseMsg> {
    call(socket, &action_msg(Action::Restart, work_dir, procfile, processes))
}

pub fn status(
    socket: &Path,
    work_dir: &Path,
    procfile: &Path,
    processes: &[String],
) -> anyhow::Result<ResponseMsg> {
    call(socket, &action_msg(Action::Status, work_dir, procfile, processes))
}

pub fn reload(socket: &Path, work_dir: &Path, procfile: &Path) -> anyhow::Result<ResponseMsg> {
    call(socket, &plain_msg(Action::Reload, work_dir, procfile))
}

pub fn run(
    socket: &Path,
    work_dir: &Path,
    procfile: &Path,
    cmd_line: Vec<String>,
) -> anyhow::Result<ResponseMsg> {
    let mut msg = plain_msg(Action::Run, work_dir, procfile);
    msg.cmd_line = Some(cmd_line);
    call(socket, &msg)
}

pub fn dump(socket: &Path, work_dir: &Path, procfile: &Path) -> anyhow::Result<ResponseMsg> {
    call(socket, &plain_msg(Action::Dump, work_dir, procfile))
}

pub fn load(socket: &Path, work_dir: &Path, procfile: &Path) -> anyhow::Result<ResponseMsg> {
    call(socket, &plain_msg(Action::Load, work_dir, procfile))
}

/// Shutdown waits a bounded time for the daemon's answer; the caller
/// follows up with a signal either way.
pub fn shutdown(
    socket: &Path,
    work_dir: &Path,
    procfile: &Path,
    timeout: Duration,
) -> anyhow::Result<ResponseMsg> {
    call_with_timeout(socket, &plain_msg(Action::Shutdown, work_dir, procfile), Some(timeout))
}
