//! Integration tests for streams over loopback, TCP and UDP
//!
//! Loopback tests drive the engines through partial transfers; the socket
//! tests run a small echo peer on a std thread.

use oc_stream::{config, Completion, Executor, LoopbackTransport, Stream, StreamError};
use proptest::prelude::*;
use std::io::{Read, Write};
use std::net::{TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn loopback_stream(read_chunk: usize, write_chunk: usize) -> (Arc<LoopbackTransport>, Stream) {
    let transport = LoopbackTransport::new(Executor::default());
    transport.set_read_chunk(read_chunk);
    transport.set_write_chunk(write_chunk);
    let stream = Stream::new(transport.clone());
    (transport, stream)
}

// =============================================================================
// Loopback
// =============================================================================

#[test]
fn test_loopback_roundtrip_across_chunk_splits() {
    for len in [1usize, 64, 4096] {
        for chunk in [1usize, 3, usize::MAX] {
            let (_transport, stream) = loopback_stream(chunk, chunk);
            let data = pattern(len);

            let written = stream.write(&data, Some(WAIT)).unwrap();
            assert!(written.error.is_none(), "len={} chunk={}", len, chunk);
            assert_eq!(written.transferred, len);

            let mut buf = vec![0u8; len];
            let read = stream.read(len, &mut buf, Some(WAIT)).unwrap();
            assert!(read.is_ok(), "len={} chunk={}", len, chunk);
            assert_eq!(read.transferred, len);
            assert_eq!(buf, data);
        }
    }
}

#[test]
fn test_loopback_read_until_keeps_surplus_for_next_read() {
    let (transport, stream) = loopback_stream(usize::MAX, usize::MAX);
    transport.set_echo(false);
    transport.feed(b"first\nsecond\nthird");

    let mut buf = vec![0u8; 32];
    let first = stream.read_until(32, &mut buf, b'\n', Some(WAIT)).unwrap();
    assert_eq!(&buf[..first.transferred], b"first\n");
    assert!(stream.reader().buffered() > 0);

    let second = stream.read_until(32, &mut buf, b'\n', Some(WAIT)).unwrap();
    assert_eq!(&buf[..second.transferred], b"second\n");

    let mut rest = vec![0u8; 5];
    let third = stream.read(5, &mut rest, Some(WAIT)).unwrap();
    assert!(third.error.is_none());
    assert_eq!(rest, b"third");
    assert_eq!(stream.reader().buffered(), 0);
}

#[test]
fn test_loopback_read_timeout_reports_partial_count() {
    let (transport, stream) = loopback_stream(usize::MAX, usize::MAX);
    transport.set_echo(false);
    transport.feed(b"abc");

    let mut buf = vec![0u8; 8];
    let completion = stream
        .read(8, &mut buf, Some(Duration::from_millis(50)))
        .unwrap();
    assert!(completion.is_timeout());
    assert_eq!(completion.transferred, 3);
    assert_eq!(&buf[..3], b"abc");
    assert!(!stream.reader().is_busy());
}

#[test]
fn test_loopback_write_timeout_on_stalled_peer() {
    let (transport, stream) = loopback_stream(usize::MAX, usize::MAX);
    transport.stall_writes(true);

    let completion = stream
        .write(b"stuck", Some(Duration::from_millis(50)))
        .unwrap();
    assert!(completion.is_timeout());
    assert_eq!(completion.transferred, 0);

    // The engine accepts new work once the timeout fired
    transport.stall_writes(false);
    let completion = stream.write(b"ok", Some(WAIT)).unwrap();
    assert!(completion.is_ok());
}

#[test]
fn test_loopback_end_of_stream_is_delivered() {
    let (transport, stream) = loopback_stream(usize::MAX, usize::MAX);
    transport.set_echo(false);

    let (tx, rx) = mpsc::channel();
    stream
        .async_read(4, vec![0; 4], Some(WAIT), move |c, buf| tx.send((c, buf)).unwrap())
        .unwrap();
    transport.feed(b"ab");
    thread::sleep(Duration::from_millis(50));
    transport.inject_read_error(StreamError::EndOfStream);

    let (completion, buf) = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(completion.error, Some(StreamError::EndOfStream)));
    assert_eq!(completion.transferred, 2);
    assert_eq!(&buf[..2], b"ab");
}

#[test]
fn test_loopback_second_async_read_is_rejected() {
    let (transport, stream) = loopback_stream(usize::MAX, usize::MAX);
    transport.set_echo(false);

    let (tx, rx) = mpsc::channel();
    stream
        .async_read(4, vec![0; 4], None, move |c, buf| tx.send((c, buf)).unwrap())
        .unwrap();
    let second = stream.async_read(4, vec![0; 4], None, |_, _| panic!("must not run"));
    assert!(matches!(second, Err(StreamError::OperationInProgress)));

    transport.feed(b"wxyz");
    let (completion, buf) = rx.recv_timeout(WAIT).unwrap();
    assert!(completion.is_ok());
    assert_eq!(buf, b"wxyz");
}

#[test]
fn test_loopback_callbacks_fire_exactly_once() {
    let (transport, stream) = loopback_stream(2, 2);
    let calls = Arc::new(AtomicUsize::new(0));

    let read_once = |timeout: Duration, feed: bool| {
        let (tx, rx) = mpsc::channel();
        let counter = calls.clone();
        stream
            .async_read(6, vec![0; 6], Some(timeout), move |c: Completion, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(c).unwrap();
            })
            .unwrap();
        if feed {
            stream.write(b"abcdef", Some(WAIT)).unwrap();
        }
        rx.recv_timeout(WAIT).unwrap()
    };

    for _ in 0..10 {
        assert!(read_once(WAIT, true).is_ok());
    }

    // Timed-out reads leave their transport reads pending on a silent peer
    transport.stall_reads(true);
    for _ in 0..10 {
        assert!(read_once(Duration::from_millis(5), false).is_timeout());
    }

    // Late continuations must not produce extra callbacks
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 20);
}

#[test]
fn test_loopback_concurrent_reader_and_writer_threads() {
    let (_transport, stream) = loopback_stream(5, 7);
    let stream = Arc::new(stream);
    let lines: Vec<String> = (0..100).map(|i| format!("line {}\n", i)).collect();

    let writer = {
        let stream = stream.clone();
        let lines = lines.clone();
        thread::spawn(move || {
            for line in &lines {
                let completion = stream.write(line.as_bytes(), Some(WAIT)).unwrap();
                assert!(completion.is_ok());
            }
        })
    };

    let mut buf = vec![0u8; 64];
    for expected in &lines {
        let completion = stream.read_until(64, &mut buf, b'\n', Some(WAIT)).unwrap();
        assert!(completion.is_ok());
        assert_eq!(&buf[..completion.transferred], expected.as_bytes());
    }
    writer.join().unwrap();
}

#[test]
fn test_blocking_call_from_callback_is_rejected() {
    let (transport, stream) = loopback_stream(usize::MAX, usize::MAX);
    transport.set_echo(false);
    let stream = Arc::new(stream);

    let (tx, rx) = mpsc::channel();
    let inner = stream.clone();
    stream
        .async_read_some(1, vec![0; 1], None, move |_, _| {
            tx.send(inner.write(b"x", None)).unwrap();
        })
        .unwrap();
    transport.feed(b"!");

    let result = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(result, Err(StreamError::BlockingInExecutor)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_read_result_independent_of_chunking(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        read_chunk in 1usize..64,
        write_chunk in 1usize..64,
    ) {
        let (_transport, stream) = loopback_stream(read_chunk, write_chunk);
        let written = stream.write(&data, Some(WAIT)).unwrap();
        prop_assert!(written.is_ok());
        prop_assert_eq!(written.transferred, data.len());

        let mut buf = vec![0u8; data.len()];
        let read = stream.read(data.len(), &mut buf, Some(WAIT)).unwrap();
        prop_assert!(read.is_ok());
        prop_assert_eq!(buf, data);
    }
}

// =============================================================================
// TCP
// =============================================================================

#[test]
fn test_tcp_echo_line() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut buf = [0u8; 256];
        loop {
            let n = socket.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            socket.write_all(&buf[..n]).unwrap();
        }
    });

    let stream = Stream::tcp("127.0.0.1", port).unwrap();
    let completion = stream.write(b"hello\nworld\n", Some(WAIT)).unwrap();
    assert_eq!(completion.transferred, 12);

    let mut buf = vec![0u8; 64];
    let first = stream.read_until(64, &mut buf, b'\n', Some(WAIT)).unwrap();
    assert_eq!(&buf[..first.transferred], b"hello\n");
    let second = stream.read_until(64, &mut buf, b'\n', Some(WAIT)).unwrap();
    assert_eq!(&buf[..second.transferred], b"world\n");

    drop(stream);
    server.join().unwrap();
}

#[test]
fn test_tcp_peer_close_is_end_of_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        socket.write_all(b"bye").unwrap();
    });

    let stream = Stream::tcp("127.0.0.1", port).unwrap();
    server.join().unwrap();

    let mut buf = vec![0u8; 16];
    let completion = stream.read(16, &mut buf, Some(WAIT)).unwrap();
    assert!(matches!(completion.error, Some(StreamError::EndOfStream)));
    assert_eq!(completion.transferred, 3);
    assert_eq!(&buf[..3], b"bye");
}

#[test]
fn test_tcp_connect_refused() {
    // Bind then drop to get a port nobody listens on
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let result = Stream::tcp("127.0.0.1", port);
    assert!(matches!(result, Err(StreamError::Connect { .. })));
}

// =============================================================================
// UDP
// =============================================================================

#[test]
fn test_udp_echo_datagram() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();
    let port = peer.local_addr().unwrap().port();
    let echo = thread::spawn(move || {
        let mut buf = [0u8; 1500];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        peer.send_to(&buf[..n], from).unwrap();
    });

    let stream = Stream::udp("127.0.0.1", port).unwrap();
    let completion = stream.write(b"ping;pong;", Some(WAIT)).unwrap();
    assert_eq!(completion.transferred, 10);

    // One datagram, two messages: the second comes from carry-over
    let mut buf = vec![0u8; 32];
    let first = stream.read_until(32, &mut buf, b';', Some(WAIT)).unwrap();
    assert_eq!(&buf[..first.transferred], b"ping;");
    let second = stream.read_until(32, &mut buf, b';', Some(WAIT)).unwrap();
    assert_eq!(&buf[..second.transferred], b"pong;");

    echo.join().unwrap();
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_stream_from_toml_config() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).unwrap();
        socket.write_all(&buf).unwrap();
    });

    let toml = format!(
        "[transport]\nkind = \"tcp\"\nhost = \"127.0.0.1\"\nport = {}\n\n[executor]\nworker_threads = 2\n",
        port
    );
    let config = config::parse(&toml).unwrap();
    let stream = Stream::from_config(&config).unwrap();
    assert!(!stream.dump_enabled());

    stream.write(b"abcd", Some(WAIT)).unwrap();
    let mut buf = vec![0u8; 4];
    let completion = stream.read(4, &mut buf, Some(WAIT)).unwrap();
    assert!(completion.is_ok());
    assert_eq!(buf, b"abcd");

    server.join().unwrap();
}
