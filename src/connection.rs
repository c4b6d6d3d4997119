//! Connections
//!
//! One logical stream or datagram endpoint owned by a [`Manager`]. The
//! handler sees a `&mut Connection` and works only through the methods here:
//! queue bytes with [`Connection::send`], eat received bytes with
//! [`Connection::consume`], and ask for teardown with
//! [`Connection::close`] or [`Connection::mark_draining`]. Teardown itself
//! happens later, inside `poll`.
//!
//! [`Manager`]: crate::Manager

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use core::any::Any;
use core::fmt;
use core::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::event::{Handler, Protocol};
use crate::manager::ManagerId;
use crate::net::SocketHandle;

/// Connection identifier, unique and increasing within one manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the connection came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Passive TCP endpoint; accepted peers become `Inbound`
    Listener,
    Outbound,
    Inbound,
    /// Bound or connected datagram socket
    Udp,
    /// One end of an in-process loopback pair
    Pipe,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the resolver
    Resolving,
    /// Transport handshake in progress
    Connecting,
    Listening,
    Open,
    /// Sending what is queued, then closing
    Draining,
    /// Scheduled for teardown in the current poll
    Closing,
    Closed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// What carries the bytes
pub(crate) enum Transport {
    /// Not opened yet (resolving, or connect deferred to the next poll)
    Pending,
    Tcp(SocketHandle),
    TcpListener(SocketHandle),
    Udp(SocketHandle),
    /// Peer end of a loopback pair
    Pipe(ConnId),
    #[cfg(feature = "std")]
    Host(crate::sock::HostSocket),
    /// Already handed back
    Released,
}

/// Events waiting for the dispatch phase of `poll`
#[derive(Debug, Default)]
pub(crate) struct PendingEvents {
    pub resolve: Option<Ipv4Addr>,
    pub connect: bool,
    pub open: bool,
    pub read: usize,
    pub write: usize,
    pub error: Option<String>,
}

impl PendingEvents {
    pub fn is_empty(&self) -> bool {
        self.resolve.is_none()
            && !self.connect
            && !self.open
            && self.read == 0
            && self.write == 0
            && self.error.is_none()
    }
}

/// Produces the handler for each peer a listener accepts
pub(crate) type HandlerFactory = Box<dyn Fn() -> Box<dyn Handler>>;

// ═══════════════════════════════════════════════════════════════════════════════
// CONNECTION
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Connection {
    id: ConnId,
    manager: ManagerId,
    kind: ConnKind,
    pub(crate) state: ConnState,
    pub(crate) local: SocketAddrV4,
    pub(crate) remote: SocketAddrV4,
    /// Host name still to be resolved
    pub(crate) host: Option<String>,
    pub(crate) recv: Buffer,
    pub(crate) send: Buffer,
    tls: bool,
    data: Option<Box<dyn Any>>,
    protocol: Protocol,
    pub(crate) handler: Option<Box<dyn Handler>>,
    pub(crate) spawn: Option<HandlerFactory>,
    pub(crate) transport: Transport,
    pub(crate) pending: PendingEvents,
    /// Drain requested before the transport opened
    drain_on_open: bool,
    pub(crate) created_ms: u64,
    pub(crate) last_activity_ms: u64,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnId,
        manager: ManagerId,
        kind: ConnKind,
        state: ConnState,
        handler: Box<dyn Handler>,
        recv_max: usize,
        send_max: usize,
        now_ms: u64,
    ) -> Self {
        let protocol = handler.protocol();
        Self {
            id,
            manager,
            kind,
            state,
            local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            remote: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            host: None,
            recv: Buffer::new(recv_max),
            send: Buffer::new(send_max),
            tls: false,
            data: None,
            protocol,
            handler: Some(handler),
            spawn: None,
            transport: Transport::Pending,
            pending: PendingEvents::default(),
            drain_on_open: false,
            created_ms: now_ms,
            last_activity_ms: now_ms,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Manager this connection belongs to
    pub fn manager(&self) -> ManagerId {
        self.manager
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    /// Peer address. For a wildcard UDP socket this follows the sender of
    /// the most recent datagram.
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn is_resolving(&self) -> bool {
        self.state == ConnState::Resolving
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnState::Connecting
    }

    /// Draining now, or will drain as soon as the connect completes
    pub fn is_draining(&self) -> bool {
        self.state == ConnState::Draining || self.drain_on_open
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnState::Closing | ConnState::Closed)
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Flag the connection as carrying TLS records; the engine only stores it
    pub fn set_tls(&mut self, tls: bool) {
        self.tls = tls;
    }

    /// Time of the last byte moved in either direction
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // BUFFERS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Received bytes not yet consumed
    pub fn received(&self) -> &[u8] {
        self.recv.as_slice()
    }

    pub fn recv_buffer(&self) -> &Buffer {
        &self.recv
    }

    pub fn send_buffer(&self) -> &Buffer {
        &self.send
    }

    /// Drop `n` bytes from the front of the receive buffer
    pub fn consume(&mut self, n: usize) -> usize {
        self.recv.consume(n)
    }

    /// Queue bytes for the transport. All or nothing: on `OutOfSpace` the
    /// send buffer is left as it was.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_closing() || self.state == ConnState::Listening {
            return Err(Error::InvalidOperation("connection cannot send"));
        }
        self.send.append(bytes)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // USER DATA
    // ═══════════════════════════════════════════════════════════════════════════

    /// Attach protocol state, replacing whatever was there
    pub fn set_data<T: Any>(&mut self, value: T) {
        self.data = Some(Box::new(value));
    }

    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_ref()?.downcast_ref::<T>()
    }

    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_data(&mut self) -> Option<Box<dyn Any>> {
        self.data.take()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TEARDOWN
    // ═══════════════════════════════════════════════════════════════════════════

    /// Close once every queued byte has been handed to the transport.
    /// A connection still resolving or connecting keeps going and starts
    /// draining when it opens; if the connect fails it reports `Error`.
    pub fn mark_draining(&mut self) {
        match self.state {
            ConnState::Open => self.state = ConnState::Draining,
            ConnState::Resolving | ConnState::Connecting => self.drain_on_open = true,
            _ => {}
        }
    }

    /// Close now; queued sends are discarded. The `Close` event follows in
    /// the same poll.
    pub fn close(&mut self) {
        if !self.is_closing() {
            debug!("[MGR] {} close requested", self.id);
            self.state = ConnState::Closing;
        }
    }

    /// Connection-fatal failure: one `Error` event, then `Close`
    pub(crate) fn fail(&mut self, error: &Error) {
        if self.is_closing() {
            return;
        }
        warn!("[MGR] {} failed: {}", self.id, error);
        self.pending.error = Some(error.to_string());
        self.state = ConnState::Closing;
    }

    /// Transport finished its handshake
    pub(crate) fn establish(&mut self, now_ms: u64) {
        if self.state == ConnState::Connecting {
            self.state = if self.drain_on_open {
                ConnState::Draining
            } else {
                ConnState::Open
            };
        }
        if self.kind == ConnKind::Outbound || self.kind == ConnKind::Udp {
            self.pending.connect = true;
        }
        self.pending.open = true;
        self.last_activity_ms = now_ms;
        debug!("[MGR] {} open {} -> {}", self.id, self.local, self.remote);
    }

    /// Peer will send nothing more
    pub(crate) fn end_of_stream(&mut self) {
        if !self.is_closing() {
            debug!("[MGR] {} peer closed", self.id);
            self.state = ConnState::Closing;
        }
    }

    /// Peer half-closed. Bytes still queued go out first, then the
    /// connection closes as if drained.
    pub(crate) fn peer_finished(&mut self) {
        if self.send.is_empty() {
            self.end_of_stream();
        } else if self.state == ConnState::Open {
            debug!("[MGR] {} peer finished, flushing {} bytes", self.id, self.send.len());
            self.state = ConnState::Draining;
        }
    }

    /// Can the transport still move bytes for this connection
    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, ConnState::Open | ConnState::Draining)
    }

    pub(crate) fn note_activity(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("recv", &self.recv.len())
            .field("send", &self.send.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn conn() -> Connection {
        let handler: Box<dyn Handler> = Box::new(|_: &mut Connection, _: &Event<'_>| {});
        Connection::new(
            ConnId(1),
            ManagerId(1),
            ConnKind::Outbound,
            ConnState::Open,
            handler,
            1024,
            16,
            0,
        )
    }

    #[test]
    fn test_send_respects_ceiling() {
        let mut c = conn();
        c.send(&[7u8; 16]).unwrap();
        assert_eq!(
            c.send(&[8u8]),
            Err(Error::OutOfSpace { requested: 1, available: 0 })
        );
        assert_eq!(c.send_buffer().as_slice(), &[7u8; 16]);
    }

    #[test]
    fn test_user_data_slot() {
        let mut c = conn();
        assert!(c.data::<u32>().is_none());
        c.set_data(41u32);
        *c.data_mut::<u32>().unwrap() += 1;
        assert_eq!(c.data::<u32>(), Some(&42));
        assert!(c.data::<i64>().is_none());
    }

    #[test]
    fn test_fail_reports_once() {
        let mut c = conn();
        c.fail(&Error::TimedOut);
        c.fail(&Error::ConnectionReset);
        assert_eq!(c.state(), ConnState::Closing);
        assert_eq!(c.pending.error.as_deref(), Some("connection timed out"));
        assert_eq!(c.send(b"x"), Err(Error::InvalidOperation("connection cannot send")));
    }

    #[test]
    fn test_draining_only_from_live_states() {
        let mut c = conn();
        c.mark_draining();
        assert!(c.is_draining());
        c.close();
        c.mark_draining();
        assert_eq!(c.state(), ConnState::Closing);
    }

    #[test]
    fn test_drain_waits_for_connect() {
        let mut c = conn();
        c.state = ConnState::Connecting;
        c.send(b"queued").unwrap();
        c.mark_draining();
        assert_eq!(c.state(), ConnState::Connecting);
        assert!(c.is_draining());

        c.establish(5);
        assert_eq!(c.state(), ConnState::Draining);
        assert!(c.pending.connect);
        assert!(c.pending.open);
    }

    #[test]
    fn test_drain_then_failed_connect_reports_error() {
        let mut c = conn();
        c.state = ConnState::Resolving;
        c.mark_draining();
        assert_eq!(c.state(), ConnState::Resolving);
        c.fail(&Error::ConnectionRefused);
        assert_eq!(c.state(), ConnState::Closing);
        assert_eq!(c.pending.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_peer_finished_flushes_queued_sends() {
        let mut c = conn();
        c.send(b"tail").unwrap();
        c.peer_finished();
        assert_eq!(c.state(), ConnState::Draining);

        c.send.consume(4);
        c.peer_finished();
        assert_eq!(c.state(), ConnState::Closing);
        assert!(c.pending.error.is_none());
    }
}
