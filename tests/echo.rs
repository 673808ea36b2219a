//! Integration tests: real TCP connections through acceptor and
//! connection state machines — ping/pong, DNS-driven connects, shutdown
//! linger and peer filtering.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use wireline::{
    CloseDirective, HostPort, IpAddress, SelectorParams, SelectorThread, TcpAcceptor,
    TcpAcceptorParams, TcpConnection, TcpConnectionParams,
};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn started_thread() -> Arc<SelectorThread> {
    let thread = Arc::new(SelectorThread::new(SelectorParams::default()).unwrap());
    assert!(thread.start());
    thread
}

fn loopback_listen_addr() -> HostPort {
    let mut addr = HostPort::new();
    addr.set_ip(IpAddress::IPV4_LOOPBACK);
    addr
}

/// Events observed by test handlers across threads.
#[derive(Debug, PartialEq, Eq)]
enum Event {
    Accepted,
    Connected,
    Read(&'static str, Vec<u8>),
    Closed(&'static str, bool),
}

fn expect_event(rx: &Receiver<Event>, what: &str) -> Event {
    rx.recv_timeout(Duration::from_secs(10))
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Install echo-test handlers: report reads, report the full close.
fn wire_handlers(conn: &Arc<TcpConnection>, side: &'static str, tx: Sender<Event>) {
    let read_conn = conn.clone();
    let read_tx = tx.clone();
    conn.set_read_handler(move || {
        let data = read_conn.inbuf().take_all();
        read_tx.send(Event::Read(side, data.to_vec())).unwrap();
        Ok(())
    });
    conn.set_write_handler(|| Ok(()));
    conn.set_close_handler(move |status, directive| {
        if directive == CloseDirective::ReadWrite {
            tx.send(Event::Closed(side, status.is_ok())).unwrap();
        }
    });
}

#[test]
fn acceptor_connection_ping_pong() {
    init_logging();
    let thread = started_thread();
    let selector = thread.selector().clone();
    let (tx, rx) = unbounded();

    let server_conn: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let acceptor = TcpAcceptor::new(selector.clone(), TcpAcceptorParams::default());
    {
        let tx = tx.clone();
        let server_conn = server_conn.clone();
        acceptor.set_accept_handler(move |conn| {
            wire_handlers(&conn, "server", tx.clone());
            // Server speaks first.
            conn.write(b"ping");
            tx.send(Event::Accepted).unwrap();
            *server_conn.lock() = Some(conn);
        });
    }
    acceptor.listen(&loopback_listen_addr()).unwrap();
    let port = acceptor.local_address().port().unwrap();

    let client = TcpConnection::new(selector.clone(), TcpConnectionParams::default());
    wire_handlers(&client, "client", tx.clone());
    {
        let client = client.clone();
        let tx = tx.clone();
        let mut remote = HostPort::new();
        remote.set_ip(IpAddress::IPV4_LOOPBACK).set_port(port);
        selector.run_in_select_loop(move || {
            client.set_connect_handler({
                let tx = tx.clone();
                move || tx.send(Event::Connected).unwrap()
            });
            client.connect(&remote).unwrap();
        });
    }

    // ping → pong → both flush-and-close.
    let mut server_closed = false;
    let mut client_closed = false;
    let mut server_seen: Option<Arc<TcpConnection>> = None;
    while !(server_closed && client_closed) {
        match expect_event(&rx, "ping-pong progress") {
            Event::Accepted | Event::Connected => {}
            Event::Read("client", data) => {
                assert_eq!(data, b"ping");
                let client = client.clone();
                selector.run_in_select_loop(move || {
                    client.write(b"pong");
                    client.flush_and_close();
                });
            }
            Event::Read("server", data) => {
                assert_eq!(data, b"pong");
                let conn = server_conn.lock().clone().expect("server connection");
                server_seen = Some(conn.clone());
                conn.flush_and_close();
            }
            Event::Closed("server", ok) => {
                assert!(ok, "server closed with an error");
                server_closed = true;
            }
            Event::Closed("client", ok) => {
                assert!(ok, "client closed with an error");
                client_closed = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    let server = server_seen.expect("server connection observed");
    assert_eq!(server.count_bytes_written(), 4);
    assert_eq!(server.count_bytes_read(), 4);
    assert_eq!(client.count_bytes_written(), 4);
    assert_eq!(client.count_bytes_read(), 4);
    assert_eq!(acceptor.stats().connections_initialized(), 1);

    acceptor.close();
    thread.stop();
    assert!(thread.loop_status().is_ok());
}

#[test]
fn connect_through_dns_resolve() {
    init_logging();
    let thread = started_thread();
    let selector = thread.selector().clone();
    let (tx, rx) = unbounded();

    let acceptor = TcpAcceptor::new(selector.clone(), TcpAcceptorParams::default());
    {
        let tx = tx.clone();
        acceptor.set_accept_handler(move |conn| {
            wire_handlers(&conn, "server", tx.clone());
            tx.send(Event::Accepted).unwrap();
            // Keep the connection alive inside its own handlers.
            let _ = conn;
        });
    }
    acceptor.listen(&loopback_listen_addr()).unwrap();
    let port = acceptor.local_address().port().unwrap();

    let client = TcpConnection::new(selector.clone(), TcpConnectionParams::default());
    wire_handlers(&client, "client", tx.clone());
    {
        let client = client.clone();
        let tx = tx.clone();
        // Name, not ip: forces the Resolving → Connecting path.
        let remote = HostPort::parse_from_string(&format!("localhost:{port}")).unwrap();
        assert!(!remote.is_resolved());
        selector.run_in_select_loop(move || {
            client.set_connect_handler({
                let tx = tx.clone();
                move || tx.send(Event::Connected).unwrap()
            });
            client.connect(&remote).unwrap();
            assert_eq!(client.state(), wireline::ConnState::Resolving);
        });
    }

    let mut connected = false;
    let mut accepted = false;
    while !(connected && accepted) {
        match expect_event(&rx, "dns connect progress") {
            Event::Connected => connected = true,
            Event::Accepted => accepted = true,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(client.state(), wireline::ConnState::Connected);
    assert!(client.get_remote_address().is_resolved());

    client.force_close();
    acceptor.close();
    thread.stop();
}

#[test]
fn shutdown_linger_force_closes() {
    init_logging();
    let thread = started_thread();
    let selector = thread.selector().clone();
    let (tx, rx) = unbounded();

    let params = TcpAcceptorParams::default().set_tcp_connection_params(
        TcpConnectionParams::default()
            .set_shutdown_linger_timeout(Duration::from_millis(100)),
    );
    let acceptor = TcpAcceptor::new(selector.clone(), params);
    {
        let tx = tx.clone();
        acceptor.set_accept_handler(move |conn| {
            wire_handlers(&conn, "server", tx.clone());
            conn.write(b"hi");
            // The peer never reads nor closes; the linger must break the
            // Flushing state.
            conn.flush_and_close();
            tx.send(Event::Accepted).unwrap();
            let _ = conn;
        });
    }
    acceptor.listen(&loopback_listen_addr()).unwrap();
    let port = acceptor.local_address().port().unwrap();

    // A raw peer that connects and then ignores the socket entirely.
    let peer = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

    assert_eq!(expect_event(&rx, "accept"), Event::Accepted);
    match expect_event(&rx, "linger close") {
        Event::Closed("server", ok) => assert!(ok),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(acceptor.stats().connections_initialized(), 1);

    drop(peer);
    acceptor.close();
    thread.stop();
}

#[test]
fn filter_handler_rejects_peers() {
    init_logging();
    let thread = started_thread();
    let selector = thread.selector().clone();

    let acceptor = TcpAcceptor::new(selector.clone(), TcpAcceptorParams::default());
    acceptor.set_filter_handler(|peer| {
        // Reject everyone; the peer address is still well-formed.
        assert!(peer.is_resolved());
        false
    });
    acceptor.set_accept_handler(|_conn| {
        panic!("filtered connections must not reach the accept handler");
    });
    acceptor.listen(&loopback_listen_addr()).unwrap();
    let port = acceptor.local_address().port().unwrap();

    let mut peer = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    // The rejected socket is closed outright; we observe EOF.
    use std::io::Read;
    let mut buf = [0u8; 1];
    let read = peer.read(&mut buf).unwrap_or(0);
    assert_eq!(read, 0);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while acceptor.stats().filtered_connections() == 0
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(acceptor.stats().filtered_connections(), 1);
    assert_eq!(acceptor.stats().connections_initialized(), 0);

    acceptor.close();
    thread.stop();
}

#[test]
fn accepted_connections_fan_out_round_robin() {
    init_logging();
    let accept_thread = started_thread();
    let worker_a = started_thread();
    let worker_b = started_thread();
    let (tx, rx) = unbounded();

    let pool = wireline::AcceptorThreads::new(vec![
        worker_a.selector().clone(),
        worker_b.selector().clone(),
    ]);
    let params = TcpAcceptorParams::default().set_acceptor_threads(pool);
    let acceptor = TcpAcceptor::new(accept_thread.selector().clone(), params);
    {
        let tx = tx.clone();
        acceptor.set_accept_handler(move |conn| {
            // Each connection must live on the selector that initialized
            // it, and that selector must be the one running this handler.
            assert!(conn.selector().is_in_select_thread());
            conn.set_write_handler(|| Ok(()));
            conn.set_read_handler(|| Ok(()));
            conn.set_close_handler(|_, _| {});
            tx.send(Event::Accepted).unwrap();
            conn.force_close();
        });
    }
    acceptor.listen(&loopback_listen_addr()).unwrap();
    let port = acceptor.local_address().port().unwrap();

    let c1 = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    let c2 = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(expect_event(&rx, "first accept"), Event::Accepted);
    assert_eq!(expect_event(&rx, "second accept"), Event::Accepted);
    drop((c1, c2));

    acceptor.close();
    accept_thread.stop();
    worker_a.stop();
    worker_b.stop();
}
