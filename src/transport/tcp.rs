use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use crate::error::{AdaptystError, Result};
use crate::transport::framed::Framed;
use crate::transport::{Acceptor, Connection};

/// Dials a TCP control connection as the peer side (session controller
/// self-dialing its own control acceptor, or dialing a remote ingest
/// server). Not an `Acceptor` method: this is the client side of the
/// handshake-free TCP variant.
pub fn dial(addr: SocketAddr) -> Result<Box<dyn Connection>> {
    let stream = TcpStream::connect(addr)
        .map_err(|e| AdaptystError::from_io(&format!("tcp dial {addr}"), e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| AdaptystError::Connection(format!("set_nodelay: {e}")))?;
    Ok(Box::new(Framed::<TcpStream>::new(stream, "tcp")))
}

pub struct TcpAcceptor {
    listener: TcpListener,
    host: IpAddr,
    port: u16,
}

impl TcpAcceptor {
    /// Binds to `host:port`. If `try_subsequent_ports` is set, increments the
    /// port on "address already in use" and retries; otherwise fails with
    /// `AlreadyInUse` (§4.1).
    pub fn bind(host: IpAddr, port: u16, try_subsequent_ports: bool) -> Result<Self> {
        let mut candidate = port;
        loop {
            match TcpListener::bind((host, candidate)) {
                Ok(listener) => {
                    return Ok(TcpAcceptor {
                        listener,
                        host,
                        port: candidate,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    if !try_subsequent_ports {
                        return Err(AdaptystError::AlreadyInUse(format!("{host}:{candidate}")));
                    }
                    candidate = candidate.checked_add(1).ok_or_else(|| {
                        AdaptystError::AlreadyInUse(format!(
                            "{host}:{candidate} (no higher ports available)"
                        ))
                    })?;
                }
                Err(e) => {
                    return Err(AdaptystError::Connection(format!(
                        "bind {host}:{candidate}: {e}"
                    )))
                }
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Acceptor for TcpAcceptor {
    fn type_tag(&self) -> &'static str {
        "tcp"
    }

    fn dial_instructions(&self) -> String {
        format!("{}_{}", self.host, self.port)
    }

    fn accept(&self, _buf_size: usize, timeout: Option<Duration>) -> Result<Box<dyn Connection>> {
        if let Some(timeout) = timeout {
            self.listener
                .set_nonblocking(false)
                .map_err(|e| AdaptystError::Connection(format!("set_nonblocking: {e}")))?;
            // std::net has no accept timeout; poll the listening fd instead.
            wait_acceptable(&self.listener, timeout)?;
        }
        let (stream, _addr) = self
            .listener
            .accept()
            .map_err(|e| AdaptystError::from_io("tcp accept", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| AdaptystError::Connection(format!("set_nodelay: {e}")))?;
        Ok(Box::new(Framed::<TcpStream>::new(stream, "tcp")))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn wait_acceptable(listener: &TcpListener, timeout: Duration) -> Result<()> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::AsRawFd;

    let fd = listener.as_raw_fd();
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let millis: i32 = timeout.as_millis().try_into().unwrap_or(i32::MAX);
    let n = poll(&mut fds, PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX))
        .map_err(|e| AdaptystError::Connection(format!("poll failed: {e}")))?;
    if n == 0 {
        return Err(AdaptystError::Timeout("tcp accept".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bind_retries_on_port_collision() {
        let first = TcpAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false).unwrap();
        let port = first.port();
        // Binding the exact same port without retry fails.
        let collision = TcpAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), port, false);
        assert!(matches!(collision, Err(AdaptystError::AlreadyInUse(_))));
        // With retry enabled, a higher port is chosen instead of failing.
        let retried = TcpAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), port, true).unwrap();
        assert!(retried.port() >= port);
    }

    #[test]
    fn dial_instructions_reports_bound_port() {
        let acceptor = TcpAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false).unwrap();
        let instructions = acceptor.dial_instructions();
        assert!(instructions.contains(&acceptor.port().to_string()));
    }

    #[test]
    fn accept_and_frame_round_trip() {
        let acceptor = TcpAcceptor::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false).unwrap();
        let port = acceptor.port();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            use std::io::Write;
            stream.write_all(b"hello\nworld\n").unwrap();
        });
        let mut conn = acceptor.accept(4096, None).unwrap();
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("hello"));
        assert_eq!(conn.read_line().unwrap().as_deref(), Some("world"));
        client.join().unwrap();
    }
}
