//! Address files a waiting debuggee leaves for `attach` by process id.
//!
//! The file is `$TMPDIR/PLAYDAP-<pid>` and contains `{"address": "...", "useTls": bool}`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PidFile {
    pub address: String,
    #[serde(default)]
    pub use_tls: bool,
}

/// Location of the address file of a process.
pub fn path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("PLAYDAP-{pid}"))
}

impl PidFile {
    pub fn read(pid: u32) -> Result<Self, Error> {
        let path = path(pid);
        let data = std::fs::read(&path).map_err(|e| {
            log::debug!(target: "debuggee", "can not read {}: {e}", path.display());
            Error::ProcessNotFound(pid)
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::InvalidConfiguration(format!("malformed address file {}: {e}", path.display()))
        })
    }

    /// Write the address file for `pid`, used by debuggee implementations.
    pub fn write(&self, pid: u32) -> Result<PathBuf, Error> {
        let path = path(pid);
        std::fs::write(&path, serde_json::to_vec(self)?)?;
        Ok(path)
    }
}
