//! Two managers talking over a simulated Ethernet wire
//!
//! Both sides share one virtual clock. Every round advances it a little and
//! polls each manager once without blocking.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use sutra_net::event;
use sutra_net::net::{MacAddress, Side, Stack, Wire};
use sutra_net::{Buffer, Clock, Connection, Event, Handler, InterfaceConfig, Manager, ManagerConfig, ManualClock};

// ═══════════════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

struct Link {
    wire: Wire,
    clock: ManualClock,
    /// 10.0.0.1
    a: Manager,
    /// 10.0.0.2
    b: Manager,
}

fn iface(n: u8) -> InterfaceConfig {
    let mut config = InterfaceConfig::fixed(
        MacAddress([0x02, 0, 0, 0, 0, n]),
        Ipv4Addr::new(10, 0, 0, n),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::UNSPECIFIED,
    );
    config.receive_queue_capacity = 64;
    config.seed = 0x1000 * n as u32 + 17;
    config
}

impl Link {
    fn new() -> Self {
        let wire = Wire::new();
        let clock = ManualClock::new(0);
        let a = Manager::with_interface(ManagerConfig::new(), clock.clone(), wire.end(Side::A), iface(1));
        let b = Manager::with_interface(ManagerConfig::new(), clock.clone(), wire.end(Side::B), iface(2));
        Self { wire, clock, a, b }
    }

    fn round(&mut self, step_ms: u64) {
        self.clock.advance(step_ms);
        self.a.poll(0);
        self.b.poll(0);
    }

    fn run(&mut self, rounds: usize, step_ms: u64) {
        for _ in 0..rounds {
            self.round(step_ms);
        }
    }

    /// Poll until `done` holds; false if it never did
    fn run_until(&mut self, rounds: usize, step_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..rounds {
            self.round(step_ms);
            if done() {
                return true;
            }
        }
        false
    }
}

type Log = Rc<RefCell<Vec<String>>>;

/// Sends back everything it receives
fn echo() -> impl Handler + Clone + 'static {
    event::from_fn(|conn: &mut Connection, ev: &Event<'_>| {
        if let Event::Read(_) = ev {
            let data = conn.received().to_vec();
            if conn.send(&data).is_ok() {
                conn.consume(data.len());
            }
        }
    })
}

/// Records events (except `Poll`) and everything received
fn recorder(log: &Log, received: &Rc<RefCell<Vec<u8>>>) -> impl Handler + Clone + 'static {
    let log = log.clone();
    let received = received.clone();
    event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| {
        match ev {
            Event::Poll(_) => return,
            Event::Read(_) => {
                let n = conn.received().len();
                received.borrow_mut().extend_from_slice(conn.received());
                conn.consume(n);
            }
            _ => {}
        }
        log.borrow_mut().push(format!("{:?}", ev));
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// TCP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_tcp_echo() {
    let mut link = Link::new();
    link.b.listen("tcp://:7", echo()).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let mut rec = recorder(&log, &received);
    let greeting = event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| {
        rec.handle(conn, ev);
        if let Event::Connect = ev {
            conn.send(b"hello, wire").unwrap();
        }
    });
    let id = link.a.connect("tcp://10.0.0.2:7", greeting).unwrap();

    let got = received.clone();
    assert!(link.run_until(200, 0, || got.borrow().as_slice() == b"hello, wire"));

    let events = log.borrow().clone();
    assert_eq!(events[0], "Connect");
    assert_eq!(events[1], "Open");
    assert!(events.iter().any(|e| e.starts_with("Write")));

    let conn = link.a.connection(id).unwrap();
    assert_eq!(*conn.remote().ip(), Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(conn.remote().port(), 7);
    assert_eq!(*conn.local().ip(), Ipv4Addr::new(10, 0, 0, 1));
    // Listener plus the accepted peer
    assert_eq!(link.b.connections().len(), 2);
}

#[test]
fn test_lost_segment_is_retransmitted() {
    let mut link = Link::new();
    link.b.listen("tcp://:7", echo()).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let id = link.a.connect("tcp://10.0.0.2:7", recorder(&log, &received)).unwrap();

    let opened = log.clone();
    assert!(link.run_until(200, 0, || opened.borrow().iter().any(|e| e == "Open")));
    // Let the handshake ACK land
    link.run(20, 0);
    assert_eq!(link.wire.in_flight(), 0);

    link.wire.drop_next(Side::A, 1);
    link.a.send(id, b"second time lucky").unwrap();

    // Nothing arrives until the retransmission timer fires
    link.run(20, 0);
    assert!(received.borrow().is_empty());

    let got = received.clone();
    assert!(link.run_until(400, 50, || got.borrow().as_slice() == b"second time lucky"));
    assert_eq!(link.wire.dropped(), 1);
    assert!(link.a.interface().unwrap().stats().tcp_retransmits >= 1);
}

#[test]
fn test_draining_client_delivers_everything_then_closes() {
    let mut link = Link::new();

    let total = Rc::new(RefCell::new(0usize));
    let server_closed = Rc::new(RefCell::new(0usize));
    let counted = total.clone();
    let closes = server_closed.clone();
    let sink = event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| match ev {
        Event::Read(_) => {
            let n = conn.received().len();
            *counted.borrow_mut() += n;
            conn.consume(n);
        }
        Event::Close => *closes.borrow_mut() += 1,
        _ => {}
    });
    link.b.listen("tcp://:9", sink).unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let client_closed = Rc::new(RefCell::new(0usize));
    let closes = client_closed.clone();
    let body = payload.clone();
    let sender = event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| match ev {
        Event::Connect => {
            conn.send(&body).unwrap();
            conn.mark_draining();
        }
        Event::Close => *closes.borrow_mut() += 1,
        _ => {}
    });
    link.a.connect("tcp://10.0.0.2:9", sender).unwrap();

    let done = server_closed.clone();
    assert!(link.run_until(2_000, 10, || *done.borrow() == 1));
    assert_eq!(*total.borrow(), payload.len());
    assert_eq!(*client_closed.borrow(), 1);

    // Only the listener is left on the server; the client has nothing
    link.run(50, 10);
    assert_eq!(*server_closed.borrow(), 1);
    assert_eq!(link.b.connections().len(), 1);
    assert!(link.a.connections().is_empty());
}

/// Counts bytes received by the server side
fn byte_counter(total: &Rc<RefCell<usize>>) -> impl Handler + Clone + 'static {
    let total = total.clone();
    event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| {
        if let Event::Read(_) = ev {
            let n = conn.received().len();
            *total.borrow_mut() += n;
            conn.consume(n);
        }
    })
}

#[test]
fn test_drain_requested_before_first_poll() {
    let mut link = Link::new();
    let total = Rc::new(RefCell::new(0usize));
    link.b.listen("tcp://:9", byte_counter(&total)).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let id = link.a.connect("tcp://10.0.0.2:9", recorder(&log, &received)).unwrap();
    link.a.send(id, &[7u8; 100]).unwrap();
    link.a.connection_mut(id).unwrap().mark_draining();
    let conn = link.a.connection(id).unwrap();
    assert!(conn.is_connecting());
    assert!(conn.is_draining());

    let seen = log.clone();
    assert!(link.run_until(500, 10, || seen.borrow().iter().any(|e| e == "Close")));
    link.run(50, 10);
    assert_eq!(*total.borrow(), 100);
    assert_eq!(*log.borrow(), vec!["Connect", "Open", "Write(100)", "Close"]);
    assert!(link.a.connections().is_empty());
}

#[test]
fn test_drain_requested_while_syn_in_flight() {
    let mut link = Link::new();
    let total = Rc::new(RefCell::new(0usize));
    link.b.listen("tcp://:9", byte_counter(&total)).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let mut rec = recorder(&log, &received);
    let mut first_poll = true;
    let hasty = event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| {
        rec.handle(conn, ev);
        if let Event::Poll(_) = ev {
            if first_poll {
                first_poll = false;
                conn.send(&[7u8; 100]).unwrap();
                conn.mark_draining();
            }
        }
    });
    let id = link.a.connect("tcp://10.0.0.2:9", hasty).unwrap();

    link.a.poll(0);
    let conn = link.a.connection(id).unwrap();
    assert!(conn.is_connecting());
    assert!(conn.is_draining());
    assert_eq!(conn.send_buffer().len(), 100);

    let seen = log.clone();
    assert!(link.run_until(500, 10, || seen.borrow().iter().any(|e| e == "Close")));
    link.run(50, 10);
    assert_eq!(*total.borrow(), 100);
    assert_eq!(*log.borrow(), vec!["Connect", "Open", "Write(100)", "Close"]);
}

#[test]
fn test_peer_half_close_keeps_queued_sends() {
    let wire = Wire::new();
    let clock = ManualClock::new(0);
    let mut client = Manager::with_interface(ManagerConfig::new(), clock.clone(), wire.end(Side::A), iface(1));
    let mut server = Stack::new(wire.end(Side::B), iface(2), 0);
    let listener = server.tcp_listen(9).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let id = client.connect("tcp://10.0.0.2:9", recorder(&log, &received)).unwrap();
    // Far more than the stack's send window
    let payload: Vec<u8> = (0..30_000u32).map(|i| (i % 253) as u8).collect();
    client.send(id, &payload).unwrap();

    let mut peer = None;
    let mut got = Buffer::new(64 * 1024);
    for _ in 0..4_000 {
        clock.advance(10);
        client.poll(0);
        let now = clock.now_ms();
        while server.receive_one(now) {}
        server.tick(now);
        if peer.is_none() {
            // Server says nothing and shuts its side down right away
            if let Some(child) = server.tcp_accept(listener) {
                server.tcp_shutdown(child, now).unwrap();
                peer = Some(child);
            }
        }
        if let Some(child) = peer {
            server.tcp_recv(child, &mut got, now).unwrap();
        }
        if got.len() == payload.len() && log.borrow().iter().any(|e| e == "Close") {
            break;
        }
    }

    assert_eq!(got.as_slice(), payload.as_slice());
    let events = log.borrow();
    assert!(!events.iter().any(|e| e.starts_with("Error")));
    assert_eq!(events.iter().filter(|e| *e == "Close").count(), 1);
}

#[test]
fn test_connect_to_closed_port_is_refused() {
    let mut link = Link::new();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    link.a.connect("tcp://10.0.0.2:81", recorder(&log, &received)).unwrap();

    let seen = log.clone();
    assert!(link.run_until(200, 0, || seen.borrow().iter().any(|e| e == "Close")));
    assert_eq!(
        *log.borrow(),
        vec![r#"Error("connection refused")"#.to_string(), "Close".to_string()]
    );
    assert!(link.b.interface().unwrap().stats().tcp_resets_sent >= 1);
    assert!(link.a.connections().is_empty());
}

#[test]
fn test_peer_close_reaches_handler() {
    let mut link = Link::new();
    // Server says hello and hangs up right away
    let greeter = event::from_fn(|conn: &mut Connection, ev: &Event<'_>| {
        if let Event::Open = ev {
            conn.send(b"bye").unwrap();
            conn.mark_draining();
        }
    });
    link.b.listen("tcp://:23", greeter).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    link.a.connect("tcp://10.0.0.2:23", recorder(&log, &received)).unwrap();

    let seen = log.clone();
    assert!(link.run_until(500, 10, || seen.borrow().iter().any(|e| e == "Close")));
    assert_eq!(received.borrow().as_slice(), b"bye");
    let events = log.borrow();
    assert!(!events.iter().any(|e| e.starts_with("Error")));
    assert_eq!(events.iter().filter(|e| *e == "Close").count(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// UDP AND ICMP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_udp_echo() {
    let mut link = Link::new();
    link.b.listen("udp://:9000", echo()).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let mut rec = recorder(&log, &received);
    let pinger = event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| {
        rec.handle(conn, ev);
        if let Event::Open = ev {
            conn.send(b"ping").unwrap();
        }
    });
    link.a.connect("udp://10.0.0.2:9000", pinger).unwrap();

    let got = received.clone();
    assert!(link.run_until(100, 0, || got.borrow().as_slice() == b"ping"));
    assert_eq!(log.borrow()[0], "Connect");
}

#[test]
fn test_same_port_over_tcp_and_udp() {
    let mut link = Link::new();
    link.b.listen("tcp://:53", echo()).unwrap();
    link.b.listen("udp://:53", echo()).unwrap();

    let log: Log = Rc::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let mut rec = recorder(&log, &received);
    let query = event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| {
        rec.handle(conn, ev);
        if let Event::Open = ev {
            conn.send(b"query").unwrap();
        }
    });
    link.a.connect("udp://10.0.0.2:53", query.clone()).unwrap();
    link.a.connect("tcp://10.0.0.2:53", query).unwrap();

    let got = received.clone();
    assert!(link.run_until(200, 0, || got.borrow().as_slice() == b"queryquery"));
}

#[test]
fn test_ping_gets_echo_reply() {
    let mut link = Link::new();
    link.run(5, 0);

    let now = link.a.now_ms();
    link.a
        .interface_mut()
        .unwrap()
        .ping(Ipv4Addr::new(10, 0, 0, 2), 0x42, 1, b"are you there", now)
        .unwrap();
    link.run(10, 0);
    assert_eq!(link.b.interface().unwrap().stats().icmp_echo_replies, 1);
}
