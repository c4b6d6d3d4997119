//! Host socket backend
//!
//! With the `std` feature and no driver attached, the manager moves bytes
//! through non-blocking `std::net` sockets instead of the built-in stack.
//! Each call here does at most one read or write and never blocks. Outbound
//! TCP connects start non-blocking and are finished by `finish_connect`.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Bytes moved per read call
const IO_CHUNK: usize = 2048;

/// Largest datagram accepted from the host
const MAX_DATAGRAM: usize = 65_507;

/// Result of one non-blocking transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Io {
    Moved(usize),
    WouldBlock,
    /// Orderly end of stream
    Closed,
}

pub(crate) enum HostSocket {
    Listener(TcpListener),
    /// Outbound connect still in flight, started at `since_ms`
    Connecting { stream: TcpStream, since_ms: u64 },
    Stream(TcpStream),
    Datagram(UdpSocket),
}

/// `connect` on a non-blocking socket reports the handshake as under way
fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const EINPROGRESS: i32 = 115;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const EINPROGRESS: i32 = 36;
    e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(EINPROGRESS)
}

fn v4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => Err(Error::InvalidAddress(v6.to_string())),
    }
}

impl HostSocket {
    pub fn tcp_listen(addr: SocketAddrV4) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self::Listener(listener))
    }

    /// Start a connect without waiting for the handshake
    pub fn tcp_connect(addr: SocketAddrV4, now_ms: u64) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self::Connecting {
            stream: TcpStream::from(socket),
            since_ms: now_ms,
        })
    }

    /// When the pending connect started
    pub fn connect_started(&self) -> Option<u64> {
        match self {
            Self::Connecting { since_ms, .. } => Some(*since_ms),
            _ => None,
        }
    }

    /// Check a pending connect without blocking. Returns the socket and
    /// whether it is connected now; a refused or unreachable peer is an
    /// error.
    pub fn finish_connect(self) -> Result<(Self, bool)> {
        let (stream, since_ms) = match self {
            Self::Connecting { stream, since_ms } => (stream, since_ms),
            other => return Ok((other, true)),
        };
        if let Some(e) = stream.take_error()? {
            return Err(e.into());
        }
        match stream.peer_addr() {
            Ok(_) => {
                stream.set_nodelay(true)?;
                Ok((Self::Stream(stream), true))
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok((Self::Connecting { stream, since_ms }, false)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn udp_bind(addr: SocketAddrV4) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self::Datagram(socket))
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let addr = match self {
            Self::Listener(l) => l.local_addr()?,
            Self::Connecting { stream, .. } | Self::Stream(stream) => stream.local_addr()?,
            Self::Datagram(d) => d.local_addr()?,
        };
        v4(addr)
    }

    /// Next pending peer on a listener
    pub fn accept(&self) -> Result<Option<(HostSocket, SocketAddrV4)>> {
        let Self::Listener(listener) = self else {
            return Err(Error::InvalidOperation("accept on a non-listening socket"));
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                Ok(Some((Self::Stream(stream), v4(peer)?)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read what fits into `dst`
    pub fn read_into(&mut self, dst: &mut Buffer) -> Result<Io> {
        let Self::Stream(stream) = self else {
            return Err(Error::InvalidOperation("read on a non-stream socket"));
        };
        let room = dst.available().min(IO_CHUNK);
        if room == 0 {
            return Ok(Io::WouldBlock);
        }
        let mut chunk = [0u8; IO_CHUNK];
        match stream.read(&mut chunk[..room]) {
            Ok(0) => Ok(Io::Closed),
            Ok(n) => Ok(Io::Moved(dst.fill(&chunk[..n]))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(Io::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_from(&mut self, src: &[u8]) -> Result<Io> {
        let Self::Stream(stream) = self else {
            return Err(Error::InvalidOperation("write on a non-stream socket"));
        };
        if src.is_empty() {
            return Ok(Io::WouldBlock);
        }
        match stream.write(src) {
            Ok(0) => Ok(Io::Closed),
            Ok(n) => Ok(Io::Moved(n)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(Io::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    pub fn recv_datagram(&self) -> Result<Option<(SocketAddrV4, Vec<u8>)>> {
        let Self::Datagram(socket) = self else {
            return Err(Error::InvalidOperation("recv on a non-datagram socket"));
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                buf.truncate(n);
                Ok(Some((v4(from)?, buf)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn send_datagram(&self, dst: SocketAddrV4, data: &[u8]) -> Result<Io> {
        let Self::Datagram(socket) = self else {
            return Err(Error::InvalidOperation("send on a non-datagram socket"));
        };
        match socket.send_to(data, dst) {
            Ok(n) => Ok(Io::Moved(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Io::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    /// Connect and spin until the handshake completes
    fn connected(addr: SocketAddrV4) -> HostSocket {
        let mut socket = HostSocket::tcp_connect(addr, 0).unwrap();
        for _ in 0..1000 {
            let (next, done) = socket.finish_connect().unwrap();
            if done {
                return next;
            }
            socket = next;
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("connect to {} never completed", addr);
    }

    #[test]
    fn test_accept_would_block_when_idle() {
        let listener = HostSocket::tcp_listen(loopback()).unwrap();
        assert!(listener.accept().unwrap().is_none());
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_stream_roundtrip() {
        let listener = HostSocket::tcp_listen(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = connected(addr);

        let mut server = None;
        for _ in 0..1000 {
            if let Some((s, _)) = listener.accept().unwrap() {
                server = Some(s);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut server = server.unwrap();

        assert_eq!(client.write_from(b"hello").unwrap(), Io::Moved(5));
        let mut buf = Buffer::new(64);
        for _ in 0..1000 {
            if server.read_into(&mut buf).unwrap() != Io::WouldBlock {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_read_with_full_buffer_does_not_report_eof() {
        let listener = HostSocket::tcp_listen(loopback()).unwrap();
        let mut client = connected(listener.local_addr().unwrap());
        let mut full = Buffer::new(0);
        assert_eq!(client.read_into(&mut full).unwrap(), Io::WouldBlock);
    }

    #[test]
    fn test_connect_returns_before_handshake() {
        let listener = HostSocket::tcp_listen(loopback()).unwrap();
        let socket = HostSocket::tcp_connect(listener.local_addr().unwrap(), 42).unwrap();
        assert_eq!(socket.connect_started(), Some(42));
        assert_ne!(socket.local_addr().unwrap().port(), 0);

        let mut socket = socket;
        let mut done = false;
        for _ in 0..1000 {
            let (next, ok) = socket.finish_connect().unwrap();
            socket = next;
            if ok {
                done = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(done);
        assert_eq!(socket.connect_started(), None);
    }

    #[test]
    fn test_connect_to_closed_port_fails_on_check() {
        // Bind then drop to find a port nobody listens on
        let port = HostSocket::tcp_listen(loopback()).unwrap().local_addr().unwrap().port();
        let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);

        let mut socket = match HostSocket::tcp_connect(target, 0) {
            Ok(socket) => socket,
            Err(e) => {
                assert_eq!(e, Error::ConnectionRefused);
                return;
            }
        };
        for _ in 0..1000 {
            match socket.finish_connect() {
                Ok((next, false)) => socket = next,
                Ok((_, true)) => panic!("connected to a closed port"),
                Err(e) => {
                    assert_eq!(e, Error::ConnectionRefused);
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("refusal never reported");
    }

    #[test]
    fn test_datagram_roundtrip() {
        let a = HostSocket::udp_bind(loopback()).unwrap();
        let b = HostSocket::udp_bind(loopback()).unwrap();
        let b_addr = b.local_addr().unwrap();
        a.send_datagram(b_addr, b"ping").unwrap();

        let mut got = None;
        for _ in 0..1000 {
            if let Some(d) = b.recv_datagram().unwrap() {
                got = Some(d);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let (from, data) = got.unwrap();
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(data, b"ping");
    }
}
