//! End-to-end exercise of the pool, poll back-end and forwarding gating
//! over real loopback sockets. The SOCKS5 handshake itself is unit-tested
//! in `socks5.rs` (it needs no real kernel redirect); this test starts a
//! relation already in `Forwarding` and focuses on the hot path: bytes in
//! one side, bytes out the other, stalled non-`FORWARDING` peers swept by
//! `remove_pending_streams`.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::fd::IntoRawFd;
use std::thread;
use std::time::Duration;

use vsocks::pool::Pool;
use vsocks::readiness::{PollBackend, Readiness};
use vsocks::relation;
use vsocks::socket;
use vsocks::stream::{Level, Role, Stream};

fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut conn, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    addr
}

fn make_forwarding_pair(pool: &mut Pool<Stream, 8>, client_fd: i32, upstream_fd: i32) {
    let a = pool.insert(Stream::new(Role::ClientSide, client_fd)).unwrap();
    let b = pool.insert(Stream::new(Role::UpstreamSide, upstream_fd)).unwrap();
    for id in [a, b] {
        let stream = pool.get_mut(id).unwrap();
        stream.level = Level::Forwarding;
        stream.requested_events = vsocks::readiness::EventSet::READABLE;
    }
    pool.get_mut(a).unwrap().peer = Some(b);
    pool.get_mut(b).unwrap().peer = Some(a);
}

#[test]
fn short_round_trip_through_forwarding_gate() {
    let upstream_addr = spawn_echo_server();

    // The "client" side of the relation: a real connected TCP stream the
    // test writes into and reads the echo back from.
    let client_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client_listen_addr = client_listener.local_addr().unwrap();
    let client_thread = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(client_listen_addr).unwrap();
        stream.write_all(b"hello forwarding").unwrap();
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        buf
    });
    let (accepted, _) = client_listener.accept().unwrap();
    accepted.set_nonblocking(true).unwrap();
    let client_fd = accepted.into_raw_fd();

    let upstream_fd = {
        let stream = std::net::TcpStream::connect(upstream_addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream.into_raw_fd()
    };

    let mut pool: Pool<Stream, 8> = Pool::new();
    make_forwarding_pair(&mut pool, client_fd, upstream_fd);

    let mut backend: PollBackend<8> = PollBackend::new();
    let mut relayed_any = false;
    for _ in 0..200 {
        let nfds = backend.wait(&mut pool, 100).unwrap();
        if nfds == 0 {
            continue;
        }
        let ready: Vec<_> = pool
            .iter()
            .filter(|(_, s)| !s.returned_events.is_empty())
            .map(|(id, _)| id)
            .collect();
        for id in ready {
            relation::drive_forwarding(&mut pool, id);
            relayed_any = true;
        }
        relation::cleanup_streams(&mut pool);
        if pool.is_empty() {
            break;
        }
    }
    assert!(relayed_any, "forwarding gate never observed any readiness");

    let echoed = client_thread.join().unwrap();
    assert_eq!(echoed, b"hello forwarding");

    socket::shutdown_then_close(client_fd);
}

#[test]
fn idle_non_forwarding_stream_is_pruned_on_timeout() {
    let mut pool: Pool<Stream, 4> = Pool::new();
    let raw = TcpListener::bind("127.0.0.1:0").unwrap().into_raw_fd();
    let id = pool.insert(Stream::new(Role::ClientSide, raw)).unwrap();
    pool.get_mut(id).unwrap().level = Level::Awaiting;

    relation::remove_pending_streams(&mut pool);
    relation::cleanup_streams(&mut pool);

    assert!(pool.is_empty());
    // fd was already closed by cleanup_streams via remove_stream.
    thread::sleep(Duration::from_millis(1));
}
