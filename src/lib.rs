//! ╔═══════════════════════════════════════════════════════════════════════════╗
//! ║                         SUTRA NET - LIBRARY ROOT                          ║
//! ║              One Thread, One Loop, Many Connections                       ║
//! ╚═══════════════════════════════════════════════════════════════════════════╝
//!
//! An embeddable, single-threaded network engine. A [`Manager`] owns a list of
//! [`Connection`]s and drives them one bounded [`Manager::poll`] at a time.
//! Protocol layers plug in as [`Handler`]s that receive [`Event`]s and work on
//! the connection's receive and send [`Buffer`]s.
//!
//! On targets without an operating system the manager runs the built-in
//! TCP/IP stack in [`net`] on top of a raw Ethernet [`net::Driver`]. With the
//! `std` feature and no driver attached, host sockets are used instead.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC MODULES
// ═══════════════════════════════════════════════════════════════════════════════

pub mod addr;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod manager;
pub mod net;
pub mod resolver;
pub mod timer;

#[cfg(feature = "std")]
mod sock;

// ═══════════════════════════════════════════════════════════════════════════════
// RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════════

pub use addr::{Scheme, Url};
pub use buffer::Buffer;
pub use clock::{Clock, ManualClock};
#[cfg(feature = "std")]
pub use clock::StdClock;
pub use config::{Addressing, InterfaceConfig, ManagerConfig, TcpConfig};
pub use connection::{ConnId, ConnKind, ConnState, Connection};
pub use error::{Error, Result};
pub use event::{Event, Handler, Protocol};
pub use manager::{Manager, ManagerId};
pub use resolver::{Resolution, Resolver, StaticResolver};
#[cfg(feature = "std")]
pub use resolver::StdResolver;
pub use timer::TimerId;
