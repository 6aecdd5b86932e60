use std::io;

use thiserror::Error;

/// The five error kinds from the design's failure envelope, each mapped to
/// the exit code the session controller must propagate.
#[derive(Debug, Error)]
pub enum AdaptystError {
    /// Invalid flag combination, missing command, malformed config. No
    /// session state is created.
    #[error("{0}")]
    User(String),

    /// Tool paths missing or of the wrong type, unsupported CPU vendor for
    /// the roofline preset. No session state is created.
    #[error("{0}")]
    Env(String),

    /// Bind collision on a TCP acceptor that was not told to retry.
    #[error("address already in use: {0}")]
    AlreadyInUse(String),

    /// Any I/O failure on a transport. Aborts the session; the temp
    /// directory is preserved for forensics.
    #[error("connection error: {0}")]
    Connection(String),

    /// Unexpected frame or out-of-state message on the control connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Only raised during file upload or an optional accept deadline; does
    /// not abort the session by itself.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Non-zero exit from a spawned child (probe or external benchmark).
    #[error("tool '{tool}' exited with status {code}")]
    Tool { tool: String, code: i32 },
}

impl AdaptystError {
    pub fn exit_code(&self) -> i32 {
        // Resolves a conflict between spec.md's §4.5 exit code table (which
        // reserves 1 for "topology/config hardware problem") and its §7
        // taxonomy (which states EnvError -> 2): topology/tool-path/CPU-vendor
        // problems are exactly what §4.5 calls "hardware problem", so EnvError
        // maps to 1. AlreadyInUse is a bind collision, not a hardware problem,
        // and §8 scenario 6 pins it to 2.
        match self {
            AdaptystError::User(_) => 3,
            AdaptystError::Env(_) => 1,
            AdaptystError::AlreadyInUse(_)
            | AdaptystError::Connection(_)
            | AdaptystError::Protocol(_)
            | AdaptystError::Timeout(_)
            | AdaptystError::Tool { .. } => 2,
        }
    }

    /// Classify an I/O error arriving from a transport read/write/accept as
    /// either a timeout or a generic connection failure, per the taxonomy in
    /// the design ("TimeoutError: only during file upload or optional accept
    /// deadlines").
    pub fn from_io(context: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                AdaptystError::Timeout(context.to_string())
            }
            io::ErrorKind::AddrInUse => AdaptystError::AlreadyInUse(context.to_string()),
            _ => AdaptystError::Connection(format!("{context}: {err}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, AdaptystError>;
