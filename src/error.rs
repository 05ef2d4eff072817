use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("timed out waiting for the debuggee to connect ({0:?})")]
    ConnectTimeout(Duration),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("TLS handshake with {0} failed: {1}")]
    TlsHandshake(String, std::io::Error),
    #[error("debuggee disconnected")]
    DebuggeeDisconnected,
    #[error("debuggee exited before connecting")]
    DebuggeeExited,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}: missing argument `{1}`")]
    MissingArgument(&'static str, &'static str),
    #[error("thread {0} is not stopped")]
    ThreadNotStopped(i64),
    #[error("unknown thread {0}")]
    UnknownThread(i64),
    #[error("unknown frame {0}")]
    UnknownFrame(i64),
    #[error("unknown variables reference {0}")]
    UnknownVariablesReference(i64),
    #[error("nested variables cannot be set, set the top level variable instead")]
    NestedSetVariable,
    #[error("restart is only supported for launched sessions")]
    UnsupportedRestart,
    #[error("no debuggee is connected")]
    NotConnected,
    #[error("session is already {0}")]
    InvalidState(&'static str),
    #[error("request cancelled")]
    Cancelled,
    #[error("runInTerminal failed: {0}")]
    Terminal(String),

    // --------------------------------- configuration errors --------------------------------------
    #[error("invalid address `{0}`: {1}")]
    InvalidAddress(String, &'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("process not found: {0}")]
    ProcessNotFound(u32),

    // --------------------------------- evaluation errors -----------------------------------------
    #[error("{0}")]
    Evaluation(String),
}

impl Error {
    /// Return true if error ends the debug session, false if it only fails
    /// the request that caused it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => true,
            Error::ConnectTimeout(_) => true,
            Error::Tls(_) => true,
            Error::TlsHandshake(_, _) => true,
            Error::DebuggeeDisconnected => true,
            Error::DebuggeeExited => true,
            Error::MalformedMessage(_) => false,
            Error::Json(_) => false,
            Error::MissingArgument(_, _) => false,
            Error::ThreadNotStopped(_) => false,
            Error::UnknownThread(_) => false,
            Error::UnknownFrame(_) => false,
            Error::UnknownVariablesReference(_) => false,
            Error::NestedSetVariable => false,
            Error::UnsupportedRestart => false,
            Error::NotConnected => false,
            Error::InvalidState(_) => false,
            Error::Cancelled => false,
            Error::Terminal(_) => false,
            Error::InvalidAddress(_, _) => false,
            Error::InvalidConfiguration(_) => false,
            Error::ProcessNotFound(_) => false,
            Error::Evaluation(_) => false,
        }
    }
}
