//! Transport (§4.1): a uniform framed byte-stream abstraction over two
//! concrete variants, TCP sockets and local process-pipe pairs.

mod framed;
mod pipe;
mod tcp;

use std::path::Path;
use std::time::Duration;

pub use pipe::PipeAcceptor;
pub use tcp::{dial as dial_tcp, TcpAcceptor};

use crate::error::Result;

/// A single established, bidirectional framed connection.
pub trait Connection: Send {
    /// Reads one newline-framed message, blocking until a full frame, EOF,
    /// or an I/O error is observed. Returns `Ok(None)` on a clean EOF with no
    /// buffered partial frame left to return (the peer closed the
    /// connection); callers that need to tell a graceful close apart from a
    /// transport failure rely on this rather than on `ConnectionError`.
    fn read_line(&mut self) -> Result<Option<String>>;

    /// As `read_line`, but raises `TimeoutError` if no frame becomes
    /// available within `secs` seconds.
    fn read_line_timeout(&mut self, secs: u64) -> Result<Option<String>>;

    /// Reads raw bytes into `buf`, returning the number of bytes read (0 on
    /// EOF). `timeout` bounds each underlying read syscall.
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    /// Writes `s` followed by `\n`. Verifies that all bytes were written;
    /// any short write is surfaced as `ConnectionError`.
    fn write_line(&mut self, s: &str) -> Result<()>;

    /// Writes raw bytes with no framing.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Streams the contents of `path` as raw bytes.
    fn send_file(&mut self, path: &Path) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Factory that yields one or more `Connection`s of a single variant.
/// `Sync` so a session controller can hand a shared reference to a
/// worker thread (the file-upload acceptor is read from both the ingest
/// thread and, on early teardown, the controller thread).
pub trait Acceptor: Send + Sync {
    fn type_tag(&self) -> &'static str;

    /// A textual address blob the peer uses to dial back (TCP: `host_port`;
    /// pipe: `fd_fd`).
    fn dial_instructions(&self) -> String;

    fn accept(&self, buf_size: usize, timeout: Option<Duration>) -> Result<Box<dyn Connection>>;

    fn close(&mut self) -> Result<()>;
}

pub(crate) const DEFAULT_READ_CHUNK: usize = 4096;
