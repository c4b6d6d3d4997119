//! Events and protocol handlers
//!
//! The manager talks to protocol layers through one stable contract: it calls
//! [`Handler::handle`] with the connection and an [`Event`]. The handler
//! works on the connection's buffers and returns; it never sees the manager,
//! so it cannot re-enter `poll` or free a connection under the loop's feet.

use core::net::Ipv4Addr;

use crate::connection::Connection;

/// Lifecycle and I/O notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    /// Connection is usable: listener bound, handshake done, pipe created
    Open,
    /// Fired on every poll iteration, for protocol-level timeouts
    Poll(u64),
    /// Host name resolved
    Resolve(Ipv4Addr),
    /// Outbound transport handshake completed
    Connect,
    /// That many new bytes were appended to the receive buffer
    Read(usize),
    /// That many bytes left the send buffer for the transport
    Write(usize),
    /// Final event; the connection is gone after this
    Close,
    /// Connection-fatal failure, followed by `Close`
    Error(&'a str),
}

/// Protocol family a handler implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Raw,
    Http,
    Ws,
    Mqtt,
    Coap,
    Dns,
    Sntp,
}

/// Protocol layer attached to a connection
pub trait Handler {
    fn handle(&mut self, conn: &mut Connection, event: &Event<'_>);

    fn protocol(&self) -> Protocol {
        Protocol::Raw
    }
}

impl<F> Handler for F
where
    F: FnMut(&mut Connection, &Event<'_>),
{
    fn handle(&mut self, conn: &mut Connection, event: &Event<'_>) {
        self(conn, event)
    }
}

/// Pin a closure to the handler signature so its argument types are inferred
pub fn from_fn<F>(f: F) -> F
where
    F: FnMut(&mut Connection, &Event<'_>),
{
    f
}
