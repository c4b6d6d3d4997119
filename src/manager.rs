//! ╔═══════════════════════════════════════════════════════════════════════════╗
//! ║                         CONNECTION MANAGER                                ║
//! ║              Owns the connections, runs the event loop                    ║
//! ╚═══════════════════════════════════════════════════════════════════════════╝
//!
//! Every [`Manager::poll`] is one bounded iteration:
//!
//! 1. work out how long we may sleep
//! 2. move frames (driver mode) or host socket bytes, sleeping if idle
//! 3. advance every connection: resolve, connect, accept, read, write
//! 4. fire due timers
//! 5. deliver queued events, then `Poll`, to each handler
//! 6. reap closing connections: `Close` exactly once, release, unlink
//!
//! Handlers only ever see `&mut Connection`, so nothing they do can re-enter
//! the loop or pull a connection out from under it.

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::mem;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, trace, warn};

use crate::addr::{Scheme, Url};
use crate::clock::Clock;
use crate::config::{InterfaceConfig, ManagerConfig};
use crate::connection::{ConnId, ConnKind, ConnState, Connection, Transport};
use crate::error::{Error, Result};
use crate::event::{Event, Handler};
use crate::net::{Driver, Stack, TcpState};
use crate::resolver::{Resolution, Resolver, StaticResolver};
use crate::timer::{TimerId, TimerList};

#[cfg(feature = "std")]
use crate::sock::{HostSocket, Io};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a manager; connections remember which one owns them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerId(pub(crate) u64);

pub struct Manager {
    id: ManagerId,
    config: ManagerConfig,
    clock: Box<dyn Clock>,
    resolver: Box<dyn Resolver>,
    /// Insertion order is iteration order
    conns: Vec<Connection>,
    next_conn: u64,
    timers: TimerList,
    iface: Option<Stack>,
}

impl Manager {
    /// Manager without a network interface. Pipes always work; with the
    /// `std` feature, `listen` and `connect` use host sockets.
    pub fn new(config: ManagerConfig, clock: impl Clock + 'static) -> Self {
        let id = ManagerId(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed));
        debug!("[MGR] manager {} created", id.0);
        Self {
            id,
            config,
            clock: Box::new(clock),
            resolver: Box::new(StaticResolver::new()),
            conns: Vec::new(),
            next_conn: 0,
            timers: TimerList::new(),
            iface: None,
        }
    }

    /// Manager driving the built-in TCP/IP stack over `driver`
    pub fn with_interface(
        config: ManagerConfig,
        clock: impl Clock + 'static,
        driver: impl Driver + 'static,
        iface: InterfaceConfig,
    ) -> Self {
        let mut manager = Self::new(config, clock);
        let now = manager.clock.now_ms();
        manager.iface = Some(Stack::new(driver, iface, now));
        manager
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn set_resolver(&mut self, resolver: impl Resolver + 'static) {
        self.resolver = Box::new(resolver);
    }

    pub fn interface(&self) -> Option<&Stack> {
        self.iface.as_ref()
    }

    pub fn interface_mut(&mut self) -> Option<&mut Stack> {
        self.iface.as_mut()
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.conns.iter().find(|c| c.id() == id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.iter_mut().find(|c| c.id() == id)
    }

    /// Live connections in creation order
    pub fn connections(&self) -> &[Connection] {
        &self.conns
    }

    /// Queue bytes on a connection from outside a handler
    pub fn send(&mut self, id: ConnId, bytes: &[u8]) -> Result<()> {
        self.connection_mut(id)
            .ok_or(Error::InvalidOperation("no such connection"))?
            .send(bytes)
    }

    /// Run `callback` after `period_ms`, and every `period_ms` after that
    /// if `repeat` is set
    pub fn add_timer(&mut self, period_ms: u64, repeat: bool, callback: impl FnMut(u64) + 'static) -> TimerId {
        let now = self.clock.now_ms();
        self.timers.add(now, period_ms, repeat, Box::new(callback))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPENING CONNECTIONS
    // ═══════════════════════════════════════════════════════════════════════════

    fn check_capacity(&self, extra: usize) -> Result<()> {
        if self.conns.len() + extra > self.config.max_connections {
            return Err(Error::TooManyConnections);
        }
        Ok(())
    }

    fn check_backend(&self) -> Result<()> {
        if self.iface.is_some() || cfg!(feature = "std") {
            Ok(())
        } else {
            Err(Error::NoInterface)
        }
    }

    fn new_conn(&mut self, kind: ConnKind, state: ConnState, handler: Box<dyn Handler>, now: u64) -> Connection {
        self.next_conn += 1;
        Connection::new(
            ConnId(self.next_conn),
            self.id,
            kind,
            state,
            handler,
            self.config.recv_max,
            self.config.send_max,
            now,
        )
    }

    /// Accept TCP peers (or datagrams, for `udp://`) on `url`.
    /// Each accepted peer gets its own clone of `handler`.
    pub fn listen<H>(&mut self, url: &str, handler: H) -> Result<ConnId>
    where
        H: Handler + Clone + 'static,
    {
        let parsed = Url::parse(url)?;
        let addr = parsed
            .socket_addr()
            .ok_or_else(|| Error::InvalidAddress(url.to_string()))?;
        self.check_backend()?;
        self.check_capacity(1)?;

        let (transport, local) = self.open_listener(parsed.scheme, addr)?;
        let now = self.clock.now_ms();
        let (kind, state) = match parsed.scheme {
            Scheme::Tcp => (ConnKind::Listener, ConnState::Listening),
            Scheme::Udp => (ConnKind::Udp, ConnState::Open),
        };
        let mut conn = self.new_conn(kind, state, Box::new(handler.clone()), now);
        conn.transport = transport;
        conn.local = local;
        conn.pending.open = true;
        if kind == ConnKind::Listener {
            conn.spawn = Some(Box::new(move || Box::new(handler.clone()) as Box<dyn Handler>));
        }
        info!("[MGR] {} listening on {}", conn.id(), url);
        let id = conn.id();
        self.conns.push(conn);
        Ok(id)
    }

    fn open_listener(&mut self, scheme: Scheme, addr: SocketAddrV4) -> Result<(Transport, SocketAddrV4)> {
        if let Some(stack) = self.iface.as_mut() {
            let ip = stack.ip().unwrap_or(Ipv4Addr::UNSPECIFIED);
            return match scheme {
                Scheme::Tcp => {
                    if addr.port() == 0 {
                        return Err(Error::InvalidAddress("TCP listener needs a port".to_string()));
                    }
                    let handle = stack.tcp_listen(addr.port())?;
                    Ok((Transport::TcpListener(handle), SocketAddrV4::new(ip, addr.port())))
                }
                Scheme::Udp => {
                    let handle = stack.udp_bind(addr.port())?;
                    let port = stack.udp_local_port(handle).unwrap_or(addr.port());
                    Ok((Transport::Udp(handle), SocketAddrV4::new(ip, port)))
                }
            };
        }

        #[cfg(feature = "std")]
        {
            let socket = match scheme {
                Scheme::Tcp => HostSocket::tcp_listen(addr)?,
                Scheme::Udp => HostSocket::udp_bind(addr)?,
            };
            let local = socket.local_addr()?;
            Ok((Transport::Host(socket), local))
        }
        #[cfg(not(feature = "std"))]
        {
            let _ = (scheme, addr);
            Err(Error::NoInterface)
        }
    }

    /// Open an outbound connection. The transport is started on the next
    /// poll; host names go through the resolver first.
    pub fn connect<H>(&mut self, url: &str, handler: H) -> Result<ConnId>
    where
        H: Handler + 'static,
    {
        let parsed = Url::parse(url)?;
        if parsed.port == 0 || parsed.host.is_empty() {
            return Err(Error::InvalidAddress(url.to_string()));
        }
        self.check_backend()?;
        self.check_capacity(1)?;

        let now = self.clock.now_ms();
        let kind = match parsed.scheme {
            Scheme::Tcp => ConnKind::Outbound,
            Scheme::Udp => ConnKind::Udp,
        };
        let mut conn = self.new_conn(kind, ConnState::Connecting, Box::new(handler), now);
        match parsed.socket_addr() {
            Some(addr) if addr.ip().is_unspecified() => {
                return Err(Error::InvalidAddress(url.to_string()));
            }
            Some(addr) => conn.remote = addr,
            None => {
                conn.state = ConnState::Resolving;
                conn.host = Some(parsed.host.to_string());
                conn.remote = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, parsed.port);
            }
        }
        debug!("[MGR] {} connecting to {}", conn.id(), url);
        let id = conn.id();
        self.conns.push(conn);
        Ok(id)
    }

    /// Two connections joined back to back inside this manager
    pub fn pair<A, B>(&mut self, a: A, b: B) -> Result<(ConnId, ConnId)>
    where
        A: Handler + 'static,
        B: Handler + 'static,
    {
        self.check_capacity(2)?;
        let now = self.clock.now_ms();
        let mut first = self.new_conn(ConnKind::Pipe, ConnState::Open, Box::new(a), now);
        let mut second = self.new_conn(ConnKind::Pipe, ConnState::Open, Box::new(b), now);
        first.transport = Transport::Pipe(second.id());
        second.transport = Transport::Pipe(first.id());
        first.pending.open = true;
        second.pending.open = true;
        let ids = (first.id(), second.id());
        debug!("[MGR] pipe {} <-> {}", ids.0, ids.1);
        self.conns.push(first);
        self.conns.push(second);
        Ok(ids)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EVENT LOOP
    // ═══════════════════════════════════════════════════════════════════════════

    /// One bounded iteration of the event loop. Blocks for at most
    /// `timeout_ms`, less when a timer or stack deadline comes first, and
    /// not at all when a connection has work pending.
    pub fn poll(&mut self, timeout_ms: u64) {
        let start = self.clock.now_ms();
        let wait = self.wait_ms(timeout_ms, start);
        let now = self.step_io(wait);
        self.advance(now);
        self.timers.fire_expired(now);
        self.dispatch(now);
        self.reap(now);
    }

    fn wait_ms(&self, timeout_ms: u64, now: u64) -> u64 {
        if timeout_ms == 0 || self.conns.iter().any(|c| self.has_work(c)) {
            return 0;
        }
        let mut wait = timeout_ms;
        if let Some(due) = self.timers.next_due() {
            wait = wait.min(due.saturating_sub(now));
        }
        if let Some(deadline) = self.iface.as_ref().and_then(|s| s.next_deadline()) {
            wait = wait.min(deadline.saturating_sub(now));
        }
        wait
    }

    /// Work the next poll can do without waiting for the network
    fn has_work(&self, conn: &Connection) -> bool {
        if !conn.pending.is_empty() {
            return true;
        }
        match conn.state {
            ConnState::Closing | ConnState::Closed | ConnState::Resolving => return true,
            ConnState::Connecting => return matches!(conn.transport, Transport::Pending),
            ConnState::Listening => return false,
            ConnState::Draining if conn.send.is_empty() => return true,
            ConnState::Open | ConnState::Draining => {}
        }

        let has_room = conn.recv.available() > 0;
        match &conn.transport {
            Transport::Tcp(h) => self.iface.as_ref().is_some_and(|stack| {
                (!conn.send.is_empty() && stack.tcp_send_capacity(*h) > 0)
                    || (has_room && stack.tcp_recv_queue(*h) > 0)
                    || stack.tcp_error(*h).is_some()
                    || stack.tcp_eof(*h)
            }),
            Transport::Udp(h) => {
                (!conn.send.is_empty() && conn.remote.port() != 0)
                    || (has_room && self.iface.as_ref().is_some_and(|s| s.udp_pending(*h) > 0))
            }
            Transport::Pipe(peer) => match self.connection(*peer) {
                Some(p) => !conn.send.is_empty() && p.recv.available() > 0,
                None => true,
            },
            #[cfg(feature = "std")]
            Transport::Host(_) => !conn.send.is_empty(),
            _ => false,
        }
    }

    /// Step (b): frames or host sockets; sleep when nothing moved.
    /// Returns the time after any sleep.
    fn step_io(&mut self, wait: u64) -> u64 {
        let now = self.clock.now_ms();
        match self.iface.as_mut() {
            Some(stack) => {
                let progressed = stack.receive_one(now);
                if !progressed && wait > 0 {
                    self.clock.sleep_ms(wait);
                }
                let now = self.clock.now_ms();
                stack.tick(now);
                now
            }
            None => {
                #[cfg(feature = "std")]
                let idle = !self.host_pass(now);
                #[cfg(not(feature = "std"))]
                let idle = true;
                if idle && wait > 0 {
                    self.clock.sleep_ms(wait);
                }
                self.clock.now_ms()
            }
        }
    }

    /// One non-blocking sweep over host sockets
    #[cfg(feature = "std")]
    fn host_pass(&mut self, now: u64) -> bool {
        let mut progressed = false;
        for conn in self.conns.iter_mut() {
            if conn.is_active() && matches!(conn.transport, Transport::Host(_)) {
                progressed |= host_transfer(conn, now);
            }
        }
        progressed
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Step (c): per-connection progress
    // ───────────────────────────────────────────────────────────────────────────

    fn advance(&mut self, now: u64) {
        let mut accepted = Vec::new();
        for idx in 0..self.conns.len() {
            if self.conns[idx].state == ConnState::Resolving {
                self.advance_resolving(idx, now);
            }
            match self.conns[idx].state {
                ConnState::Connecting => self.advance_connecting(idx, now),
                ConnState::Listening => self.accept_peers(idx, now, &mut accepted),
                ConnState::Open | ConnState::Draining => {
                    self.transfer(idx, now);
                }
                _ => {}
            }

            let conn = &mut self.conns[idx];
            if conn.state == ConnState::Draining && conn.send.is_empty() {
                debug!("[MGR] {} drained", conn.id());
                conn.state = ConnState::Closing;
            }
        }
        self.conns.extend(accepted);
    }

    fn advance_resolving(&mut self, idx: usize, now: u64) {
        let conn = &mut self.conns[idx];
        let Some(host) = conn.host.clone() else {
            conn.state = ConnState::Connecting;
            return;
        };
        match self.resolver.resolve(&host, now) {
            Resolution::Resolved(ip) => {
                debug!("[MGR] {} resolved {} to {}", conn.id(), host, ip);
                conn.remote = SocketAddrV4::new(ip, conn.remote.port());
                conn.pending.resolve = Some(ip);
                conn.host = None;
                conn.state = ConnState::Connecting;
            }
            Resolution::Failed => conn.fail(&Error::ResolveFailed(host)),
            Resolution::Pending => {
                if now.saturating_sub(conn.created_ms) >= self.config.resolve_timeout_ms {
                    conn.fail(&Error::ResolveFailed(host));
                }
            }
        }
    }

    fn advance_connecting(&mut self, idx: usize, now: u64) {
        let conn = &mut self.conns[idx];
        let handshake = match conn.transport {
            Transport::Pending => None,
            Transport::Tcp(h) => Some(h),
            #[cfg(feature = "std")]
            Transport::Host(_) => None,
            _ => return,
        };

        let Some(stack) = self.iface.as_mut() else {
            #[cfg(feature = "std")]
            host_connect(conn, self.config.connect_timeout_ms, now);
            #[cfg(not(feature = "std"))]
            conn.fail(&Error::NoInterface);
            return;
        };

        match handshake {
            None if conn.kind() == ConnKind::Udp => match stack.udp_connect(conn.remote) {
                Ok(handle) => {
                    let port = stack.udp_local_port(handle).unwrap_or(0);
                    conn.local = SocketAddrV4::new(stack.ip().unwrap_or(Ipv4Addr::UNSPECIFIED), port);
                    conn.transport = Transport::Udp(handle);
                    conn.establish(now);
                }
                Err(e) => conn.fail(&e),
            },
            None => match stack.tcp_connect(conn.remote, now) {
                Ok(handle) => {
                    if let Some((local, _)) = stack.tcp_endpoints(handle) {
                        conn.local = local;
                    }
                    conn.transport = Transport::Tcp(handle);
                }
                Err(e) => conn.fail(&e),
            },
            Some(handle) => match stack.tcp_state(handle) {
                Some(state) if state.is_synchronized() => conn.establish(now),
                Some(TcpState::Closed) | None => {
                    let error = stack.tcp_error(handle).unwrap_or(Error::ConnectionRefused);
                    conn.fail(&error);
                }
                _ => {}
            },
        }
    }

    fn accept_peers(&mut self, idx: usize, now: u64, accepted: &mut Vec<Connection>) {
        let live = self.conns.len();
        let listener = &self.conns[idx];
        let Some(spawn) = listener.spawn.as_ref() else {
            return;
        };

        match &listener.transport {
            Transport::TcpListener(handle) => {
                let Some(stack) = self.iface.as_mut() else {
                    return;
                };
                while let Some(child) = stack.tcp_accept(*handle) {
                    if live + accepted.len() >= self.config.max_connections {
                        warn!("[MGR] {} connection limit reached, dropping peer", listener.id());
                        stack.tcp_abort(child, now);
                        continue;
                    }
                    self.next_conn += 1;
                    let mut conn = Connection::new(
                        ConnId(self.next_conn),
                        self.id,
                        ConnKind::Inbound,
                        ConnState::Open,
                        spawn(),
                        self.config.recv_max,
                        self.config.send_max,
                        now,
                    );
                    if let Some((local, remote)) = stack.tcp_endpoints(child) {
                        conn.local = local;
                        conn.remote = remote;
                    }
                    conn.transport = Transport::Tcp(child);
                    conn.establish(now);
                    debug!("[MGR] {} accepted {} as {}", listener.id(), conn.remote, conn.id());
                    accepted.push(conn);
                }
            }
            #[cfg(feature = "std")]
            Transport::Host(socket) => loop {
                let (stream, peer) = match socket.accept() {
                    Ok(Some(pair)) => pair,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[MGR] {} accept failed: {}", listener.id(), e);
                        break;
                    }
                };
                if live + accepted.len() >= self.config.max_connections {
                    warn!("[MGR] {} connection limit reached, dropping peer", listener.id());
                    continue;
                }
                self.next_conn += 1;
                let mut conn = Connection::new(
                    ConnId(self.next_conn),
                    self.id,
                    ConnKind::Inbound,
                    ConnState::Open,
                    spawn(),
                    self.config.recv_max,
                    self.config.send_max,
                    now,
                );
                conn.local = stream.local_addr().unwrap_or(listener.local);
                conn.remote = peer;
                conn.transport = Transport::Host(stream);
                conn.establish(now);
                debug!("[MGR] {} accepted {} as {}", listener.id(), peer, conn.id());
                accepted.push(conn);
            },
            _ => {}
        }
    }

    /// Move bytes between a connection's buffers and its transport
    fn transfer(&mut self, idx: usize, now: u64) -> bool {
        let peer = match self.conns[idx].transport {
            Transport::Pipe(peer) => Some(peer),
            _ => None,
        };
        if let Some(peer) = peer {
            return self.transfer_pipe(idx, peer, now);
        }

        let conn = &mut self.conns[idx];
        match conn.transport {
            Transport::Tcp(handle) => {
                let Some(stack) = self.iface.as_mut() else {
                    return false;
                };
                let mut moved = false;
                let read = stack.tcp_recv(handle, &mut conn.recv, now).unwrap_or(0);
                if read > 0 {
                    conn.pending.read += read;
                    moved = true;
                }
                if !conn.send.is_empty() {
                    match stack.tcp_send(handle, conn.send.as_slice(), now) {
                        Ok(0) => {}
                        Ok(n) => {
                            conn.send.consume(n);
                            conn.pending.write += n;
                            moved = true;
                        }
                        Err(e) => conn.fail(&e),
                    }
                }
                if moved {
                    conn.note_activity(now);
                }
                let state = stack.tcp_state(handle);
                if let Some(error) = stack.tcp_error(handle) {
                    conn.fail(&error);
                } else if matches!(state, None | Some(TcpState::Closed)) {
                    conn.end_of_stream();
                } else if stack.tcp_eof(handle) {
                    if state.is_some_and(|s| s.can_send()) {
                        conn.peer_finished();
                    } else {
                        conn.end_of_stream();
                    }
                }
                moved
            }
            Transport::Udp(handle) => {
                let Some(stack) = self.iface.as_mut() else {
                    return false;
                };
                let mut moved = false;
                if conn.recv.available() > 0 {
                    if let Some((from, datagram)) = stack.udp_recv(handle) {
                        trace!("[MGR] {} datagram of {} from {}", conn.id(), datagram.len(), from);
                        conn.remote = from;
                        match conn.recv.append(&datagram) {
                            Ok(()) => conn.pending.read += datagram.len(),
                            Err(e) => conn.fail(&e),
                        }
                        moved = true;
                    }
                }
                if !conn.send.is_empty() && conn.remote.port() != 0 {
                    let len = conn.send.len();
                    match stack.udp_send(handle, Some(conn.remote), conn.send.as_slice(), now) {
                        Ok(()) => {
                            conn.send.consume(len);
                            conn.pending.write += len;
                            moved = true;
                        }
                        Err(e) => conn.fail(&e),
                    }
                }
                if moved {
                    conn.note_activity(now);
                }
                moved
            }
            #[cfg(feature = "std")]
            Transport::Host(_) => host_transfer(conn, now),
            _ => false,
        }
    }

    fn transfer_pipe(&mut self, idx: usize, peer: ConnId, now: u64) -> bool {
        let Some(peer_idx) = self.conns.iter().position(|c| c.id() == peer) else {
            self.conns[idx].end_of_stream();
            return false;
        };
        let (me, other) = pair_mut(&mut self.conns, idx, peer_idx);
        if other.is_closing() || me.send.is_empty() {
            return false;
        }
        let n = other.recv.fill(me.send.as_slice());
        if n == 0 {
            return false;
        }
        me.send.consume(n);
        me.pending.write += n;
        other.pending.read += n;
        me.note_activity(now);
        other.note_activity(now);
        true
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Steps (e) and (f): events and teardown
    // ───────────────────────────────────────────────────────────────────────────

    fn dispatch(&mut self, now: u64) {
        for conn in self.conns.iter_mut() {
            deliver_pending(conn);
            if !conn.is_closing() {
                deliver(conn, &Event::Poll(now));
            }
        }
    }

    fn reap(&mut self, now: u64) {
        let mut idx = 0;
        while idx < self.conns.len() {
            if !self.conns[idx].is_closing() {
                idx += 1;
                continue;
            }
            let mut conn = self.conns.remove(idx);
            deliver_pending(&mut conn);
            deliver(&mut conn, &Event::Close);
            conn.state = ConnState::Closed;
            self.release(&mut conn, now);
            debug!("[MGR] {} closed", conn.id());
        }
    }

    /// Hand the transport back. TCP sockets close gracefully and finish the
    /// FIN exchange inside the stack.
    fn release(&mut self, conn: &mut Connection, now: u64) {
        match mem::replace(&mut conn.transport, Transport::Released) {
            Transport::Tcp(handle) | Transport::TcpListener(handle) => {
                if let Some(stack) = self.iface.as_mut() {
                    stack.tcp_close(handle, now);
                }
            }
            Transport::Udp(handle) => {
                if let Some(stack) = self.iface.as_mut() {
                    stack.udp_close(handle);
                }
            }
            _ => {}
        }
    }
}

/// Call the handler with one event
fn deliver(conn: &mut Connection, event: &Event<'_>) {
    if let Some(mut handler) = conn.handler.take() {
        handler.handle(conn, event);
        conn.handler = Some(handler);
    }
}

/// Lifecycle events in contract order, Read and Write coalesced
fn deliver_pending(conn: &mut Connection) {
    if let Some(ip) = conn.pending.resolve.take() {
        deliver(conn, &Event::Resolve(ip));
    }
    if mem::take(&mut conn.pending.connect) {
        deliver(conn, &Event::Connect);
    }
    if mem::take(&mut conn.pending.open) {
        deliver(conn, &Event::Open);
    }
    let read = mem::take(&mut conn.pending.read);
    if read > 0 {
        deliver(conn, &Event::Read(read));
    }
    let written = mem::take(&mut conn.pending.write);
    if written > 0 {
        deliver(conn, &Event::Write(written));
    }
    if let Some(message) = conn.pending.error.take() {
        deliver(conn, &Event::Error(&message));
    }
}

/// Two distinct elements of one slice
fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// Open a host socket for `conn`, or check on the connect already under
/// way. Never waits for the handshake.
#[cfg(feature = "std")]
fn host_connect(conn: &mut Connection, timeout_ms: u64, now: u64) {
    let socket = match mem::replace(&mut conn.transport, Transport::Released) {
        Transport::Pending => match conn.kind() {
            ConnKind::Udp => HostSocket::udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            _ => HostSocket::tcp_connect(conn.remote, now),
        },
        Transport::Host(socket) => Ok(socket),
        other => {
            conn.transport = other;
            return;
        }
    };

    match socket.and_then(HostSocket::finish_connect) {
        Ok((socket, true)) => {
            if let Ok(local) = socket.local_addr() {
                conn.local = local;
            }
            conn.transport = Transport::Host(socket);
            conn.establish(now);
        }
        Ok((socket, false)) => {
            let since = socket.connect_started().unwrap_or(now);
            conn.transport = Transport::Host(socket);
            if now.saturating_sub(since) >= timeout_ms {
                conn.fail(&Error::TimedOut);
            } else {
                trace!("[MGR] {} connect to {} in progress", conn.id(), conn.remote);
            }
        }
        Err(e) => conn.fail(&e),
    }
}

#[cfg(feature = "std")]
fn host_transfer(conn: &mut Connection, now: u64) -> bool {
    let Transport::Host(socket) = &mut conn.transport else {
        return false;
    };
    let mut moved = false;
    let mut failure = None;
    let mut closed = false;

    match socket {
        HostSocket::Stream(_) => {
            match socket.read_into(&mut conn.recv) {
                Ok(Io::Moved(n)) => {
                    conn.pending.read += n;
                    moved = true;
                }
                Ok(Io::Closed) => closed = true,
                Ok(Io::WouldBlock) => {}
                Err(e) => failure = Some(e),
            }
            if failure.is_none() && !conn.send.is_empty() {
                match socket.write_from(conn.send.as_slice()) {
                    Ok(Io::Moved(n)) => {
                        conn.send.consume(n);
                        conn.pending.write += n;
                        moved = true;
                    }
                    Ok(_) => {}
                    Err(e) => failure = Some(e),
                }
            }
        }
        HostSocket::Datagram(_) => {
            if conn.recv.available() > 0 {
                match socket.recv_datagram() {
                    Ok(Some((from, datagram))) => {
                        conn.remote = from;
                        match conn.recv.append(&datagram) {
                            Ok(()) => conn.pending.read += datagram.len(),
                            Err(e) => failure = Some(e),
                        }
                        moved = true;
                    }
                    Ok(None) => {}
                    Err(e) => failure = Some(e),
                }
            }
            if failure.is_none() && !conn.send.is_empty() && conn.remote.port() != 0 {
                match socket.send_datagram(conn.remote, conn.send.as_slice()) {
                    Ok(Io::Moved(_)) => {
                        let len = conn.send.len();
                        conn.send.consume(len);
                        conn.pending.write += len;
                        moved = true;
                    }
                    Ok(_) => {}
                    Err(e) => failure = Some(e),
                }
            }
        }
        HostSocket::Listener(_) | HostSocket::Connecting { .. } => {}
    }

    if moved {
        conn.note_activity(now);
    }
    if let Some(e) = failure {
        conn.fail(&e);
    } else if closed {
        conn.peer_finished();
    }
    moved
}
