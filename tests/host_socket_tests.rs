//! Manager over host sockets on the loopback interface

use std::cell::RefCell;
use std::rc::Rc;

use sutra_net::event;
use sutra_net::{Connection, Event, Handler, Manager, ManagerConfig, StdClock};

/// Rounds of `poll(10)` before giving up
const MAX_ROUNDS: usize = 500;

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

/// Sends `greeting` once connected and collects what comes back
fn client(greeting: &'static [u8], got: &Rc<RefCell<Vec<u8>>>) -> impl Handler + 'static {
    let sink = got.clone();
    event::from_fn(move |conn: &mut Connection, ev: &Event<'_>| match ev {
        Event::Connect => conn.send(greeting).unwrap(),
        Event::Read(_) => {
            sink.borrow_mut().extend_from_slice(conn.received());
            let n = conn.received().len();
            conn.consume(n);
        }
        _ => {}
    })
}

fn poll_until(mgr: &mut Manager, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..MAX_ROUNDS {
        mgr.poll(10);
        if done() {
            return true;
        }
    }
    false
}

#[test]
fn test_tcp_echo_over_loopback() {
    let mut mgr = Manager::new(ManagerConfig::new(), StdClock::new());
    let listener = mgr.listen("tcp://127.0.0.1:0", echo()).unwrap();
    let port = mgr.connection(listener).unwrap().local().port();
    assert_ne!(port, 0);

    let got = Rc::new(RefCell::new(Vec::new()));
    let url = format!("tcp://127.0.0.1:{}", port);
    mgr.connect(&url, client(b"over the loop", &got)).unwrap();

    let check = got.clone();
    assert!(poll_until(&mut mgr, || check.borrow().as_slice() == b"over the loop"));
    // Listener, accepted peer, outbound connection
    assert_eq!(mgr.connections().len(), 3);
}

#[test]
fn test_udp_echo_over_loopback() {
    let mut mgr = Manager::new(ManagerConfig::new(), StdClock::new());
    let server = mgr.listen("udp://127.0.0.1:0", echo()).unwrap();
    let port = mgr.connection(server).unwrap().local().port();

    let got = Rc::new(RefCell::new(Vec::new()));
    let url = format!("udp://127.0.0.1:{}", port);
    mgr.connect(&url, client(b"datagram", &got)).unwrap();

    let check = got.clone();
    assert!(poll_until(&mut mgr, || check.borrow().as_slice() == b"datagram"));
}

#[test]
fn test_peer_hangup_closes_connection() {
    let mut mgr = Manager::new(ManagerConfig::new(), StdClock::new());
    let hangup = event::from_fn(|conn: &mut Connection, ev: &Event<'_>| {
        if let Event::Open = ev {
            conn.close();
        }
    });
    let listener = mgr.listen("tcp://127.0.0.1:0", hangup).unwrap();
    let port = mgr.connection(listener).unwrap().local().port();

    let closed = Rc::new(RefCell::new(0usize));
    let count = closed.clone();
    let watcher = event::from_fn(move |_: &mut Connection, ev: &Event<'_>| {
        if let Event::Close = ev {
            *count.borrow_mut() += 1;
        }
    });
    mgr.connect(&format!("tcp://127.0.0.1:{}", port), watcher).unwrap();

    let check = closed.clone();
    assert!(poll_until(&mut mgr, || *check.borrow() == 1));
    // Only the listener survives
    assert_eq!(mgr.connections().len(), 1);
}

#[test]
fn test_refused_connect_reports_error_without_stalling_poll() {
    let mut mgr = Manager::new(ManagerConfig::new(), StdClock::new());
    // Find a loopback port with no listener behind it
    let listener = mgr.listen("tcp://127.0.0.1:0", echo()).unwrap();
    let port = mgr.connection(listener).unwrap().local().port();
    mgr.connection_mut(listener).unwrap().close();
    mgr.poll(0);
    assert!(mgr.connections().is_empty());

    let events = Rc::new(RefCell::new(Vec::new()));
    let log = events.clone();
    let watcher = event::from_fn(move |_: &mut Connection, ev: &Event<'_>| {
        if !matches!(ev, Event::Poll(_)) {
            log.borrow_mut().push(format!("{:?}", ev));
        }
    });
    let id = mgr.connect(&format!("tcp://127.0.0.1:{}", port), watcher).unwrap();

    // The first poll only starts the connect
    let started = std::time::Instant::now();
    mgr.poll(0);
    assert!(started.elapsed() < std::time::Duration::from_millis(1_000));

    let check = events.clone();
    assert!(poll_until(&mut mgr, || check.borrow().iter().any(|e| e == "Close")));
    assert_eq!(
        *events.borrow(),
        vec![r#"Error("connection refused")"#.to_string(), "Close".to_string()]
    );
    assert!(mgr.connection(id).is_none());
}
