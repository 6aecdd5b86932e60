//! Shared framing logic used by both the TCP and pipe `Connection`
//! implementations: newline-delimited reads with partial-frame carry-over
//! and FIFO queuing of multiple frames observed in one read syscall.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use crate::error::{AdaptystError, Result};
use crate::transport::{Connection, DEFAULT_READ_CHUNK};

/// Byte-oriented I/O that can be polled for readiness, used for both
/// `TcpStream` and pipe file descriptors.
pub trait IoStream: Read + Write + AsRawFd + Send {}
impl<T: Read + Write + AsRawFd + Send> IoStream for T {}

pub struct Framed<S: IoStream> {
    stream: S,
    buf: Vec<u8>,
    queue: VecDeque<String>,
    eof: bool,
    tag: &'static str,
}

impl<S: IoStream> Framed<S> {
    pub fn new(stream: S, tag: &'static str) -> Self {
        Framed {
            stream,
            buf: Vec::with_capacity(DEFAULT_READ_CHUNK),
            queue: VecDeque::new(),
            eof: false,
            tag,
        }
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<()> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let Some(timeout) = timeout else {
            return Ok(());
        };
        let fd = self.stream.as_raw_fd();
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let millis: i32 = timeout.as_millis().try_into().unwrap_or(i32::MAX);
        let n = poll(&mut fds, PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX))
            .map_err(|e| AdaptystError::Connection(format!("poll failed: {e}")))?;
        if n == 0 {
            return Err(AdaptystError::Timeout(format!("{} read", self.tag)));
        }
        Ok(())
    }

    /// Pulls any complete frames currently buffered into `queue`.
    fn drain_complete_frames(&mut self) {
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            let frame = String::from_utf8_lossy(&self.buf[start..end]).into_owned();
            self.queue.push_back(frame);
            start = end + 1;
        }
        self.buf.drain(..start);
    }

    fn read_frame(&mut self, timeout: Option<Duration>) -> Result<Option<String>> {
        loop {
            if let Some(frame) = self.queue.pop_front() {
                return Ok(Some(frame));
            }
            if self.eof {
                if !self.buf.is_empty() {
                    let frame = String::from_utf8_lossy(&self.buf).into_owned();
                    self.buf.clear();
                    return Ok(Some(frame));
                }
                return Ok(None);
            }

            self.wait_readable(timeout)?;
            let mut chunk = [0u8; DEFAULT_READ_CHUNK];
            let n = self
                .stream
                .read(&mut chunk)
                .map_err(|e| AdaptystError::from_io(&format!("{} read", self.tag), e))?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.buf.extend_from_slice(&chunk[..n]);
            self.drain_complete_frames();
        }
    }
}

impl<S: IoStream> Connection for Framed<S> {
    fn read_line(&mut self) -> Result<Option<String>> {
        self.read_frame(None)
    }

    fn read_line_timeout(&mut self, secs: u64) -> Result<Option<String>> {
        self.read_frame(Some(Duration::from_secs(secs)))
    }

    fn read_bytes(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        // Any bytes already queued/buffered from frame reads come first, so
        // callers that interleave read_line/read_bytes on the same
        // connection never lose data.
        if !self.buf.is_empty() {
            let n = buf.len().min(self.buf.len());
            buf[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            return Ok(n);
        }
        if self.eof {
            return Ok(0);
        }
        self.wait_readable(timeout)?;
        self.stream
            .read(buf)
            .map_err(|e| AdaptystError::from_io(&format!("{} read", self.tag), e))
    }

    fn write_line(&mut self, s: &str) -> Result<()> {
        let mut framed = Vec::with_capacity(s.len() + 1);
        framed.extend_from_slice(s.as_bytes());
        framed.push(b'\n');
        self.write_bytes(&framed)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.stream
            .write_all(buf)
            .map_err(|e| AdaptystError::from_io(&format!("{} write", self.tag), e))
    }

    fn send_file(&mut self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| AdaptystError::Connection(format!("open {}: {e}", path.display())))?;
        let mut chunk = [0u8; DEFAULT_READ_CHUNK];
        loop {
            let n = file
                .read(&mut chunk)
                .map_err(|e| AdaptystError::Connection(format!("read {}: {e}", path.display())))?;
            if n == 0 {
                break;
            }
            self.write_bytes(&chunk[..n])?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn raw_fd_of<S: IoStream>(framed: &Framed<S>) -> RawFd {
    framed.stream.as_raw_fd()
}

// Re-export io::Error mapping helper used by both acceptor implementations.
pub(crate) fn map_io(context: &str, err: io::Error) -> AdaptystError {
    AdaptystError::from_io(context, err)
}
