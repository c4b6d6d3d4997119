//! Error types
//!
//! One error enum for the whole engine. Parsers report [`Error::Malformed`],
//! which the stack turns into a counted drop; connection-level failures are
//! delivered to handlers as `Event::Error` and never unwind the event loop.

use alloc::string::String;

/// Engine error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A buffer would grow beyond its `max_capacity`
    #[error("buffer out of space: {requested} bytes requested, {available} available")]
    OutOfSpace { requested: usize, available: usize },

    /// A URL or address could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// URL scheme other than `tcp` or `udp`
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Local port already bound
    #[error("address in use")]
    AddressInUse,

    /// Connection table or socket arena exhausted
    #[error("too many connections")]
    TooManyConnections,

    /// No network interface and no host sockets available
    #[error("no network interface attached")]
    NoInterface,

    /// Driver reported a transmit failure or is down
    #[error("network driver unavailable")]
    DriverUnavailable,

    /// Next hop did not answer ARP, or no route
    #[error("host unreachable")]
    HostUnreachable,

    /// Peer refused the connection (RST in SYN-SENT or ICMP unreachable)
    #[error("connection refused")]
    ConnectionRefused,

    /// Peer reset an established connection
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Handshake, retransmission or keepalive budget exhausted
    #[error("connection timed out")]
    TimedOut,

    /// Name lookup failed or timed out
    #[error("name resolution failed: {0}")]
    ResolveFailed(String),

    /// Operation does not apply to this connection kind or state
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// Malformed wire data
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Host socket error
    #[error("i/o error: {0}")]
    Io(String),
}

/// Engine result type
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(feature = "std")]
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Error::ConnectionReset,
            ErrorKind::TimedOut => Error::TimedOut,
            ErrorKind::AddrInUse => Error::AddressInUse,
            _ => Error::Io(alloc::format!("{}", err)),
        }
    }
}
