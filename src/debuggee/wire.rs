//! Messages exchanged with the debuggee and their framing.
//!
//! Every frame is a 4 byte little-endian payload length followed by a JSON document.

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use strum_macros::{EnumIter, IntoStaticStr};

/// Frames larger than this are treated as garbage.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Variable namespace of a stopped frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeKind {
    #[strum(serialize = "Module Options")]
    ModuleOptions,
    #[strum(serialize = "Task Variables")]
    TaskVariables,
    #[strum(serialize = "Host Variables")]
    HostVariables,
    #[strum(serialize = "Global Variables")]
    GlobalVariables,
}

impl ScopeKind {
    /// Name shown to the user.
    pub fn title(self) -> &'static str {
        self.into()
    }

    /// Fetching this scope may take a while, clients show it collapsed.
    pub fn expensive(self) -> bool {
        matches!(self, ScopeKind::HostVariables | ScopeKind::GlobalVariables)
    }
}

/// Task result classes that stop a host without a user breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionKind {
    Failed,
    Unreachable,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub line: i64,
    pub task_id: String,
    #[serde(default = "breakable_default")]
    pub breakable: bool,
}

fn breakable_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub is_include: bool,
}

/// Payload of a request that the debuggee answers with [`DebuggeeMessage::Reply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RequestBody {
    #[serde(rename_all = "camelCase")]
    Variables {
        host: String,
        task_id: String,
        scope: ScopeKind,
    },
    #[serde(rename_all = "camelCase")]
    SetVariable {
        host: String,
        task_id: String,
        scope: ScopeKind,
        name: String,
        /// Template expression producing the new value.
        expression: String,
    },
    #[serde(rename_all = "camelCase")]
    Evaluate {
        host: String,
        task_id: String,
        expression: String,
        context: Option<String>,
    },
    /// Client request relayed as is.
    Forward { command: String, arguments: Value },
}

/// Adapter to debuggee messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AdapterMessage {
    #[serde(rename_all = "camelCase")]
    Configure { exception_filters: Vec<String> },
    ConfigurationDone,
    /// Let a blocked host run.
    Resume { host: String },
    EvaluateCondition {
        token: u64,
        host: String,
        expression: String,
    },
    Request { id: u64, body: RequestBody },
    #[serde(rename_all = "camelCase")]
    Disconnect { terminate_debuggee: bool },
}

/// Debuggee to adapter messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DebuggeeMessage {
    /// Positions of tasks found in a file, sent when a file is loaded.
    TasksDiscovered {
        file: String,
        positions: Vec<PositionInfo>,
    },
    /// Host is about to run a task and waits for a decision.
    TaskStart {
        host: String,
        task: TaskInfo,
        /// Identifier of the include task this task comes from.
        #[serde(default)]
        parent: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TaskEnd { host: String, task_id: String },
    HostEnded { host: String },
    /// Host hit a failure class the user may want to inspect, it waits for a decision.
    #[serde(rename_all = "camelCase")]
    Exception {
        host: String,
        task_id: String,
        kind: ExceptionKind,
        #[serde(default)]
        result: Value,
    },
    ConditionResult {
        token: u64,
        host: String,
        #[serde(default)]
        matched: Option<bool>,
        #[serde(default)]
        error: Option<String>,
    },
    Reply {
        id: u64,
        success: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        body: Option<Value>,
    },
    /// DAP event relayed to the client as is.
    Event {
        event: String,
        #[serde(default)]
        body: Option<Value>,
    },
}

/// Write one frame.
pub fn write_frame<W: Write + ?Sized, T: Serialize>(writer: &mut W, msg: &T) -> Result<(), Error> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::MalformedMessage(format!(
            "frame of {} bytes is too large",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends on a frame boundary. A frame that does not
/// decode into `T` is reported as [`Error::MalformedMessage`], the stream stays aligned.
pub fn read_frame<R: Read + ?Sized, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, Error> {
    let mut header = [0u8; 4];
    loop {
        match reader.read(&mut header[..1]) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    reader.read_exact(&mut header[1..])?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::IO(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {len} bytes is too large"),
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| Error::MalformedMessage(e.to_string()))
}
