use std::fmt;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header: 8-byte big-endian payload length.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single frame payload. A control message is a few
/// hundred bytes; anything near this limit is a corrupt or hostile peer.
pub const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    Run = 0,
    Log = 1,
    Kill = 2,
    Start = 3,
    Stop = 4,
    Status = 5,
    Restart = 6,
    Shutdown = 7,
    Reload = 8,
    Dump = 9,
    Load = 10,
}

impl From<Action> for u8 {
    fn from(a: Action) -> u8 {
        a as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Action::Run,
            1 => Action::Log,
            2 => Action::Kill,
            3 => Action::Start,
            4 => Action::Stop,
            5 => Action::Status,
            6 => Action::Restart,
            7 => Action::Shutdown,
            8 => Action::Reload,
            9 => Action::Dump,
            10 => Action::Load,
            other => return Err(format!("unknown action tag: {other}")),
        })
    }
}

impl Action {
    /// Success message reported back for the actions that return process lists.
    pub fn response_message(&self) -> &'static str {
        match self {
            Action::Run => "Run command successfully",
            Action::Start => "Start processes successfully",
            Action::Stop => "Stop processes successfully",
            Action::Status => "Check processes status successfully",
            Action::Restart => "Restart processes successfully",
            Action::Reload => "Reload successfully",
            _ => "OK",
        }
    }
}

/// What the server does with the connection after the response is written.
/// Never serialized; observed by the accept loop only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCtl {
    Normal,
    Shutdown,
    Reload,
    MsgErr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Standby,
    Starting,
    Started,
    Running,
    Stopping,
    Stopped,
    Failed,
    NotFound,
    Unknown,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Standby => "Standby",
            ProcessState::Starting => "Starting",
            ProcessState::Started => "Started",
            ProcessState::Running => "Running",
            ProcessState::Stopping => "Stopping",
            ProcessState::Stopped => "Stopped",
            ProcessState::Failed => "Failed",
            ProcessState::NotFound => "NotFound",
            ProcessState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionMsg {
    pub action: Action,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub procfile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_line: Option<Vec<String>>,
}

/// Over-the-wire snapshot of one process. Timestamps are milliseconds
/// since the Unix epoch, 0 when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcInfo {
    pub pid: i32,
    pub name: String,
    pub project: String,
    pub start_at: i64,
    pub stop_at: i64,
    pub status: ProcessState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseMsg {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<ProcInfo>>,
}

impl ResponseMsg {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { code: 200, message: message.into(), processes: None }
    }

    pub fn with_processes(message: impl Into<String>, processes: Vec<ProcInfo>) -> Self {
        Self { code: 200, message: message.into(), processes: Some(processes) }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), processes: None }
    }
}

pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| anyhow::anyhow!("cbor encode failed: {e}"))?;
    Ok(buf)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| anyhow::anyhow!("cbor decode failed: {e}"))
}

fn check_frame_len(len: u64) -> anyhow::Result<usize> {
    anyhow::ensure!(len <= MAX_FRAME_BYTES, "frame of {len} bytes exceeds limit");
    Ok(len as usize)
}

pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = check_frame_len(u64::from_be_bytes(header))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(body.len() as u64).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub fn read_frame_sync<R: Read>(reader: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = check_frame_len(u64::from_be_bytes(header))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

pub fn write_frame_sync<W: Write>(writer: &mut W, body: &[u8]) -> anyhow::Result<()> {
    writer.write_all(&(body.len() as u64).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Parse a process selector: `*` selects everything, otherwise names are
/// joined by `;`. Names may be bare or fully qualified (`app::proc`).
pub fn parse_selector(selector: &str) -> Vec<String> {
    if selector == "*" {
        return vec!["*".to_string()];
    }
    selector
        .split(';')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
