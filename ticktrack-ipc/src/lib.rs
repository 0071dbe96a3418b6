//! Channel protocol between the ticktrack daemon and its UI clients
//!
//! Every connected client holds one duplex channel over a Unix domain socket.
//! Frames are single-line JSON documents. Clients send [`ClientMessage`]s,
//! the daemon broadcasts [`ServerMessage`]s to every open channel.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tokio::net::UnixStream;

/// Commands a UI client can send to the timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    StartTimer,
    PauseTimer,
    StopTimer,
    UpdateTasks(Vec<TaskRef>),
    SetActiveTask(TaskRef),
}

/// State pushed from the daemon to every connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    TaskUpdate(TaskUpdate),
}

/// Reference to a task owned by the external task-management system.
///
/// Only the id is meaningful here; any other fields a UI attaches are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

impl TaskRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    /// Selected task, `None` when nothing is selected
    pub id: Option<String>,
    /// Seconds accrued by the selected task
    pub timer: u64,
    pub run_state: RunState,
    /// Seconds accrued across every tracked task
    pub total_worked: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Stopped,
    Paused,
    Running,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Stopped => "stopped",
            RunState::Paused => "paused",
            RunState::Running => "running",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Connection refused - is ticktrack running?")]
    ConnectionRefused,
}

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/ticktrack.sock";

/// Longest accepted frame, newline excluded
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Open a channel to the daemon listening on `path`.
///
/// A missing socket file or a socket nobody listens on both map to
/// [`IpcError::ConnectionRefused`].
pub async fn connect(path: impl AsRef<Path>) -> Result<UnixStream, IpcError> {
    UnixStream::connect(path).await.map_err(|e| match e.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::NotFound => IpcError::ConnectionRefused,
        _ => IpcError::Io(e),
    })
}

/// Serialize a message as one newline-terminated frame.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_client_message(line: &str) -> Result<ClientMessage, IpcError> {
    decode(line)
}

pub fn decode_server_message(line: &str) -> Result<ServerMessage, IpcError> {
    decode(line)
}

fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, IpcError> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if line.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge(line.len()));
    }
    Ok(serde_json::from_str(line)?)
}
