//! Debug adapter: one session between a DAP client and a playbook debuggee.
//!
//! Two reader threads, one per peer, push everything they receive into a single queue.
//! The session loop is the only owner of adapter state and handles queue items one at a time.

pub mod breakpoint;
pub mod connect;
pub mod coordinator;
pub mod session;
pub mod variables;

pub use session::{Session, SessionState};

use crate::dap::protocol::ClientMessage;
use crate::dap::transport::DapReader;
use crate::debuggee::socket::DebuggeeChannel;
use crate::debuggee::wire::{self, DebuggeeMessage};
use crate::error::Error;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

/// Item of the session queue.
#[derive(Debug)]
pub enum Input {
    Client(ClientMessage),
    /// Client stream ended or broke.
    ClientClosed,
    Debuggee {
        generation: u64,
        message: DebuggeeMessage,
    },
    DebuggeeClosed {
        generation: u64,
    },
    /// Result of a connection attempt started by `launch`, `attach` or `restart`.
    DebuggeeConnected {
        generation: u64,
        result: Result<DebuggeeChannel, Error>,
    },
}

/// Sends its notice when dropped, a reader thread that unwinds still reports its end.
struct ClosedNotice {
    inputs: Sender<Input>,
    notice: Option<Input>,
}

impl ClosedNotice {
    fn new(inputs: Sender<Input>, notice: Input) -> Self {
        Self {
            inputs,
            notice: Some(notice),
        }
    }
}

impl Drop for ClosedNotice {
    fn drop(&mut self) {
        if let Some(notice) = self.notice.take() {
            _ = self.inputs.send(notice);
        }
    }
}

/// Read client messages until the stream ends.
///
/// `disconnecting` is raised as soon as a `disconnect` request arrives, so that requests
/// still queued in front of it are answered as cancelled instead of being executed.
pub fn spawn_client_reader(
    mut reader: DapReader,
    inputs: Sender<Input>,
    disconnecting: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let _closed = ClosedNotice::new(inputs.clone(), Input::ClientClosed);
        loop {
            let value = match reader.read_message() {
                Ok(Some(value)) => value,
                Ok(None) => {
                    log::info!(target: "dap", "client closed the connection");
                    break;
                }
                Err(e) if e.is_fatal() => {
                    log::warn!(target: "dap", "client read failed: {e}");
                    break;
                }
                Err(e) => {
                    log::warn!(target: "dap", "skip client message: {e}");
                    continue;
                }
            };
            let message = match ClientMessage::from_value(value) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!(target: "dap", "skip client message: {e}");
                    continue;
                }
            };
            if let ClientMessage::Request(req) = &message
                && req.command == "disconnect"
            {
                disconnecting.store(true, Ordering::SeqCst);
            }
            if inputs.send(Input::Client(message)).is_err() {
                return;
            }
        }
    });
}

/// Read debuggee messages until the channel ends.
pub fn spawn_debuggee_reader(mut reader: Box<dyn Read + Send>, generation: u64, inputs: Sender<Input>) {
    std::thread::spawn(move || {
        let _closed = ClosedNotice::new(inputs.clone(), Input::DebuggeeClosed { generation });
        loop {
            match wire::read_frame::<_, DebuggeeMessage>(&mut reader) {
                Ok(Some(message)) => {
                    log::trace!(target: "debuggee", "<- {message:?}");
                    if inputs.send(Input::Debuggee { generation, message }).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    log::info!(target: "debuggee", "debuggee closed the connection");
                    break;
                }
                Err(Error::MalformedMessage(e)) => {
                    log::warn!(target: "debuggee", "skip debuggee message: {e}");
                }
                Err(e) => {
                    log::warn!(target: "debuggee", "debuggee read failed: {e}");
                    break;
                }
            }
        }
    });
}
