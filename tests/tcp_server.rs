//! End-to-end scenarios against a real `TcpServer`, real sockets, and real
//! OS threads, mirroring `tokio-rs-mio`'s `tests/tcp.rs` style (bind,
//! connect with `std::net`, assert on observed bytes/events) rather than
//! mocking any part of the stack.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::{mpsc, Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use netreactor::{Buffer, EventLoopThread, InetAddress, ServerOptions, TcpConnection, TcpServer};

fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

fn random_port() -> u16 {
    20_000 + (rand::random::<u16>() % 20_000)
}

fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("failed to connect to {addr}");
}

/// Force an RST instead of a graceful FIN on drop, via `SO_LINGER{on, 0}`.
fn set_linger_zero(stream: &TcpStream) {
    let l = libc::linger { l_onoff: 1, l_linger: 0 };
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &l as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}

/// Shrink the receive window so a large send backs up in the framework's
/// output buffer instead of draining straight into the kernel.
fn set_small_rcvbuf(stream: &TcpStream) {
    let val: libc::c_int = 4096;
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Single message echoed back, then the server
/// shuts down its write side; the client observes the bytes then EOF, and
/// `onConnection` fires with `connected() == false` once the client's own
/// FIN lets the server finish tearing down.
#[test]
fn echo_single_message_then_shutdown() {
    init();
    let base_thread = EventLoopThread::new(None);
    let base_loop = base_thread.start_loop();

    let port = random_port();
    let server = TcpServer::new(
        base_loop,
        InetAddress::loopback(port),
        "echo-test",
        ServerOptions::default(),
    )
    .unwrap();

    let (conn_tx, conn_rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
        conn_tx.send(conn.connected()).unwrap();
    }));
    server.set_message_callback(Arc::new(
        |conn: &Arc<TcpConnection>, buf: &mut Buffer, _receive_time: Instant| {
            let data = buf.retrieve_all_as_vec();
            conn.send(&data);
            conn.shutdown();
        },
    ));
    server.set_thread_num(0);
    server.start();

    let mut client = connect_with_retry(SocketAddr::from(([127, 0, 0, 1], port)));
    client.write_all(b"hello\n").unwrap();

    assert!(conn_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"hello\n");

    drop(client);
    assert!(!conn_rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

/// Six clients connecting one at a time against a 3-sub-loop
/// pool land on exactly 3 distinct loops, in round-robin order.
#[test]
fn multi_client_fanout_round_robins_across_three_subloops() {
    init();
    let base_thread = EventLoopThread::new(None);
    let base_loop = base_thread.start_loop();

    let port = random_port();
    let server = TcpServer::new(
        base_loop,
        InetAddress::loopback(port),
        "fanout-test",
        ServerOptions::default(),
    )
    .unwrap();

    let (conn_tx, conn_rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
        if conn.connected() {
            conn_tx.send(Arc::as_ptr(&conn.get_loop()) as usize).unwrap();
        }
    }));
    server.set_thread_num(3);
    server.start();

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut clients = Vec::new();
    let mut loop_ids = Vec::new();
    for _ in 0..6 {
        clients.push(connect_with_retry(addr));
        loop_ids.push(conn_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    let distinct: HashSet<_> = loop_ids.iter().copied().collect();
    assert_eq!(distinct.len(), 3, "expected exactly 3 distinct sub-loops, got {:?}", loop_ids);
    for i in 0..3 {
        assert_eq!(loop_ids[i], loop_ids[i + 3], "round-robin period should be 3");
    }
}

/// A 10 MiB send issued from a thread other than the IO loop
/// arrives in full and in order, and `onWriteComplete` fires exactly once.
#[test]
fn large_payload_drains_completely_and_write_complete_fires_once() {
    init();
    let base_thread = EventLoopThread::new(None);
    let base_loop = base_thread.start_loop();

    let port = random_port();
    let server = TcpServer::new(
        base_loop,
        InetAddress::loopback(port),
        "drain-test",
        ServerOptions::default(),
    )
    .unwrap();

    let (established_tx, established_rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
        if conn.connected() {
            established_tx.send(Arc::clone(conn)).unwrap();
        }
    }));
    let (complete_tx, complete_rx) = mpsc::channel();
    server.set_write_complete_callback(Arc::new(move |_conn: &Arc<TcpConnection>| {
        complete_tx.send(()).unwrap();
    }));
    server.set_thread_num(1);
    server.start();

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut client = connect_with_retry(addr);
    let conn = established_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let payload = vec![0xABu8; 10 * 1024 * 1024];
    let payload_for_send = payload.clone();
    let send_thread = thread::spawn(move || {
        conn.send(&payload_for_send);
    });

    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    send_thread.join().unwrap();
    complete_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(
        complete_rx.try_recv().is_err(),
        "onWriteComplete should fire exactly once for a batch that fully drains"
    );
}

/// A 1 MiB high-water mark crossed by a 2 MiB send while the
/// peer stalls fires the callback once; once the peer drains, the output
/// buffer empties and `onWriteComplete` fires once.
#[test]
fn high_water_mark_fires_while_peer_stalls_then_drains() {
    init();
    let base_thread = EventLoopThread::new(None);
    let base_loop = base_thread.start_loop();

    let port = random_port();
    let server = TcpServer::new(
        base_loop,
        InetAddress::loopback(port),
        "hwm-test",
        ServerOptions::default(),
    )
    .unwrap();

    let (established_tx, established_rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
        if conn.connected() {
            established_tx.send(Arc::clone(conn)).unwrap();
        }
    }));

    const HIGH_WATER_MARK: usize = 1024 * 1024;
    let (hwm_tx, hwm_rx) = mpsc::channel();
    server.set_high_water_mark_callback(
        Arc::new(move |_conn: &Arc<TcpConnection>, total: usize| {
            hwm_tx.send(total).unwrap();
        }),
        HIGH_WATER_MARK,
    );
    let (complete_tx, complete_rx) = mpsc::channel();
    server.set_write_complete_callback(Arc::new(move |_conn: &Arc<TcpConnection>| {
        complete_tx.send(()).unwrap();
    }));
    server.set_thread_num(1);
    server.start();

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut client = connect_with_retry(addr);
    set_small_rcvbuf(&client);
    let conn = established_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let payload = vec![0x5Au8; 2 * 1024 * 1024];
    let payload_for_send = payload.clone();
    thread::spawn(move || {
        conn.send(&payload_for_send);
    });

    let total = hwm_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(total >= HIGH_WATER_MARK, "high-water callback fired with total={total}");

    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    complete_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

/// A peer RST mid-connection (no further data) is observed as
/// a close with no `onMessage` delivery.
#[test]
fn peer_reset_removes_connection_without_message_callback() {
    init();
    let base_thread = EventLoopThread::new(None);
    let base_loop = base_thread.start_loop();

    let port = random_port();
    let server = TcpServer::new(
        base_loop,
        InetAddress::loopback(port),
        "reset-test",
        ServerOptions::default(),
    )
    .unwrap();

    let (conn_tx, conn_rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
        conn_tx.send(conn.connected()).unwrap();
    }));
    let (msg_tx, msg_rx) = mpsc::channel::<usize>();
    server.set_message_callback(Arc::new(
        move |_conn: &Arc<TcpConnection>, buf: &mut Buffer, _receive_time: Instant| {
            msg_tx.send(buf.readable_bytes()).unwrap();
            buf.retrieve_all();
        },
    ));
    server.set_thread_num(0);
    server.start();

    let client = connect_with_retry(SocketAddr::from(([127, 0, 0, 1], port)));
    assert!(conn_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    set_linger_zero(&client);
    drop(client);

    assert!(!conn_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(
        msg_rx.try_recv().is_err(),
        "onMessage must not fire for a reset that carried no data"
    );
}

/// `shutdown()` followed by a `send()` from another thread
/// drops the late payload; no bytes for it reach the peer.
#[test]
fn send_after_shutdown_from_another_thread_is_dropped() {
    init();
    let base_thread = EventLoopThread::new(None);
    let base_loop = base_thread.start_loop();

    let port = random_port();
    let server = TcpServer::new(
        base_loop,
        InetAddress::loopback(port),
        "shutdown-test",
        ServerOptions::default(),
    )
    .unwrap();

    let (established_tx, established_rx) = mpsc::channel();
    server.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
        if conn.connected() {
            established_tx.send(Arc::clone(conn)).unwrap();
        }
    }));
    server.set_thread_num(0);
    server.start();

    let mut client = connect_with_retry(SocketAddr::from(([127, 0, 0, 1], port)));
    let conn = established_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    conn.shutdown();

    let conn_for_thread = Arc::clone(&conn);
    thread::spawn(move || {
        conn_for_thread.send(b"too late");
    })
    .join()
    .unwrap();

    let mut received = Vec::new();
    let _ = client.read_to_end(&mut received);
    assert!(received.is_empty(), "no bytes should arrive for a send issued after shutdown");
}
