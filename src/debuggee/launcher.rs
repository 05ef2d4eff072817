//! Wrapper the client runs in its terminal on `launch`.
//!
//! `playdap run --exit-notify <address> -- <command>` runs the debuggee command and
//! connects to `address` once the command is gone, so that the adapter stops waiting for
//! a debuggee that will never connect.

use crate::debuggee::addr::SocketAddress;
use crate::debuggee::socket;
use crate::error::Error;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::time::Duration;

/// Exit code when the debuggee command can not be started.
pub const SPAWN_FAILED: i32 = 127;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `command` to completion and notify the adapter waiting on `notify`.
///
/// Returns the exit code the wrapper should leave with: the one of the command, or
/// `128 + signal` when a signal killed it.
pub fn run(notify: &SocketAddress, command: &[String]) -> i32 {
    let code = match execute(command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("playdap: can not run debuggee: {e}");
            SPAWN_FAILED
        }
    };
    log::debug!(target: "debuggee", "debuggee command exited with {code}");

    match socket::connect(notify, NOTIFY_TIMEOUT) {
        Ok(stream) => {
            if let Err(e) = stream.shutdown() {
                log::debug!(target: "debuggee", "exit notification shutdown: {e}");
            }
        }
        Err(e) => log::debug!(target: "debuggee", "exit notification to {notify} failed: {e}"),
    }
    code
}

fn execute(command: &[String]) -> Result<i32, Error> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::InvalidConfiguration("empty debuggee command".into()))?;
    let status = Command::new(program).args(args).status()?;
    Ok(status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1))
}
