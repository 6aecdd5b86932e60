//! Local process-pipe transport. Each `PipeAcceptor` owns one OS pipe pair
//! in each direction; the two child-facing descriptors are reported (as
//! fixed target numbers the peer will see after `dup2`) via
//! `dial_instructions()` in the `fd_fd` format from the glossary.
//!
//! The handshake is the peer writing the literal token `connect` as the
//! first frame on the new connection; anything else is a protocol error.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::pipe;

use crate::error::{AdaptystError, Result};
use crate::transport::framed::Framed;
use crate::transport::{Acceptor, Connection};

fn set_cloexec(fd: RawFd) -> Result<()> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    fcntl(borrowed, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| AdaptystError::Connection(format!("fcntl FD_CLOEXEC: {e}")))?;
    Ok(())
}

pub struct BidiPipe {
    read: File,
    write: File,
}

impl Read for BidiPipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read.read(buf)
    }
}

impl Write for BidiPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write.flush()
    }
}

impl AsRawFd for BidiPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

pub struct PipeAcceptor {
    parent_read: Option<File>,
    parent_write: Option<File>,
    child_write: RawFd,
    child_read: RawFd,
    target_read: RawFd,
    target_write: RawFd,
}

impl PipeAcceptor {
    /// Creates a fresh pipe pair. `target_read`/`target_write` are the
    /// descriptor numbers the peer process will see its ends duplicated
    /// onto (chosen by the caller, typically the profiler probe launcher),
    /// and are only used to render `dial_instructions()`.
    pub fn new(target_read: RawFd, target_write: RawFd) -> Result<Self> {
        // child writes, parent reads
        let (c2p_read, c2p_write) =
            pipe().map_err(|e| AdaptystError::Connection(format!("pipe: {e}")))?;
        // parent writes, child reads
        let (p2c_read, p2c_write) =
            pipe().map_err(|e| AdaptystError::Connection(format!("pipe: {e}")))?;

        set_cloexec(c2p_read.as_raw_fd())?;
        set_cloexec(p2c_write.as_raw_fd())?;
        // Intentionally NOT cloexec: probe.rs dup2()s these onto the target
        // descriptors in a pre_exec hook; dup2'd fds never inherit the
        // source's FD_CLOEXEC flag, so the duplicate survives exec while the
        // original (and every other probe's pipe fds, which are cloexec)
        // close automatically.
        let child_write = c2p_write.as_raw_fd();
        let child_read = p2c_read.as_raw_fd();
        std::mem::forget(c2p_write);
        std::mem::forget(p2c_read);

        Ok(PipeAcceptor {
            parent_read: Some(File::from(c2p_read)),
            parent_write: Some(File::from(p2c_write)),
            child_write,
            child_read,
            target_read,
            target_write,
        })
    }

    /// Source fds to `dup2` onto `target_write`/`target_read` respectively
    /// in the spawned probe's `pre_exec` hook.
    ///
    /// Ownership of these two descriptors passes to the caller once this is
    /// called: the acceptor's own `close`/`Drop` only ever touch
    /// `parent_read`/`parent_write`. The caller (the session controller,
    /// once the probe has been spawned and has its own `dup2`'d copies) is
    /// responsible for closing both with `libc::close` — otherwise the
    /// long-lived controller process keeps a write-end reference to the
    /// probe's data pipe open for the whole session, and the subclient's
    /// EOF-driven read loop (§4.2) never unblocks even after the probe
    /// exits.
    pub fn child_facing_fds(&self) -> (RawFd, RawFd) {
        (self.child_write, self.child_read)
    }
}

impl Acceptor for PipeAcceptor {
    fn type_tag(&self) -> &'static str {
        "pipe"
    }

    fn dial_instructions(&self) -> String {
        format!("{}_{}", self.target_read, self.target_write)
    }

    fn accept(&self, _buf_size: usize, timeout: Option<Duration>) -> Result<Box<dyn Connection>> {
        let read_fd = self
            .parent_read
            .as_ref()
            .ok_or_else(|| AdaptystError::Connection("pipe acceptor already closed".into()))?
            .try_clone()
            .map_err(|e| AdaptystError::Connection(format!("dup pipe read end: {e}")))?;
        let write_fd = self
            .parent_write
            .as_ref()
            .ok_or_else(|| AdaptystError::Connection("pipe acceptor already closed".into()))?
            .try_clone()
            .map_err(|e| AdaptystError::Connection(format!("dup pipe write end: {e}")))?;

        let bidi = BidiPipe {
            read: read_fd,
            write: write_fd,
        };
        let mut conn = Framed::new(bidi, "pipe");

        let handshake = match timeout {
            Some(d) => conn.read_line_timeout(d.as_secs().max(1))?,
            None => conn.read_line()?,
        };
        match handshake.as_deref() {
            Some("connect") => Ok(Box::new(conn)),
            Some(other) => Err(AdaptystError::Protocol(format!(
                "pipe handshake expected 'connect', got '{other}'"
            ))),
            None => Err(AdaptystError::Protocol(
                "pipe handshake: connection closed before handshake".into(),
            )),
        }
    }

    /// Closes only the parent-facing ends. The child-facing ends are the
    /// caller's responsibility (see `child_facing_fds`) and must already be
    /// closed in the controller process by the time a probe has been
    /// spawned — closing them again here would double-close a descriptor
    /// number the OS may since have reused for something else.
    fn close(&mut self) -> Result<()> {
        self.parent_read.take();
        self.parent_write.take();
        Ok(())
    }
}

impl Drop for PipeAcceptor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_handshake() {
        let acceptor = PipeAcceptor::new(10, 11).unwrap();
        let write_fd = libc_dup(cr_write_end(&acceptor));
        let mut writer = unsafe { File::from_raw_fd(write_fd) };
        writer.write_all(b"not-connect\n").unwrap();
        let result = acceptor.accept(4096, Some(Duration::from_secs(2)));
        assert!(matches!(result, Err(AdaptystError::Protocol(_))));
    }

    // Test helper: duplicate the raw fd the child would write into, without
    // consuming the acceptor's own copy.
    fn cr_write_end(acceptor: &PipeAcceptor) -> RawFd {
        acceptor.child_facing_fds().0
    }

    fn libc_dup(fd: RawFd) -> RawFd {
        unsafe { libc::dup(fd) }
    }

    #[test]
    fn accepts_connect_handshake() {
        let acceptor = PipeAcceptor::new(10, 11).unwrap();
        let write_fd = libc_dup(cr_write_end(&acceptor));
        let mut writer = unsafe { File::from_raw_fd(write_fd) };
        let handle = std::thread::spawn(move || {
            writer.write_all(b"connect\nhello\n").unwrap();
        });
        let mut conn = acceptor.accept(4096, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("hello"));
        handle.join().unwrap();
    }
}
