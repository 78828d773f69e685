//! End-to-end tests for the message server and client.
//!
//! Every test runs its own server on OS-assigned ports with a private
//! message context, so tests can run in parallel.

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use taskwire::transport::{AsyncRecvMessageEndpoint, MessageEndpoint};
use taskwire::{
    Address, ConnectType, Message, MessageContext, MessageEndpointClient, MessageEndpointServer,
    Result, ServerConfig, ServerDispatch, SocketType, TransportError, LOCALHOST,
};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Records every call it receives. Replies PONG to PING and echoes the
/// reversed payload otherwise.
#[derive(Default)]
struct Recorder {
    async_calls: AtomicUsize,
    sync_calls: AtomicUsize,
    stops: AtomicUsize,
    workers: Mutex<HashSet<String>>,
    sequence_nums: Mutex<Vec<i32>>,
    /// How long a request with payload "slow" takes
    slow_request: Duration,
    /// How long the first worker to stop takes to tear down
    first_stop_delay: Duration,
    first_stop_taken: AtomicBool,
}

impl Recorder {
    fn record_worker(&self) {
        let name = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        self.workers.lock().unwrap().insert(name);
    }
}

impl ServerDispatch for Recorder {
    fn do_async_recv(&self, message: &Message) -> Result<()> {
        self.record_worker();
        self.sequence_nums
            .lock()
            .unwrap()
            .push(message.sequence_num());
        self.async_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn do_sync_recv(&self, message: &Message) -> Result<Bytes> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        if message.data() == b"PING" {
            return Ok(Bytes::from_static(b"PONG"));
        }
        if message.data() == b"slow" {
            std::thread::sleep(self.slow_request);
        }
        let mut reversed = message.data().to_vec();
        reversed.reverse();
        Ok(Bytes::from(reversed))
    }

    fn on_worker_stop(&self) {
        if !self.first_stop_taken.swap(true, Ordering::SeqCst) {
            std::thread::sleep(self.first_stop_delay);
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn start_server(label: &str, threads: usize, timeout: Duration) -> MessageEndpointServer<Recorder> {
    let config = ServerConfig::new(label, 0, 0)
        .with_threads(threads)
        .with_timeout(timeout);
    start_server_with(config, Recorder::default())
}

fn start_server_with(config: ServerConfig, recorder: Recorder) -> MessageEndpointServer<Recorder> {
    let mut server = MessageEndpointServer::with_context(config, recorder, MessageContext::new());
    server.start().expect("Failed to start server");
    server
}

fn client_for(server: &MessageEndpointServer<Recorder>) -> MessageEndpointClient {
    MessageEndpointClient::with_context(
        MessageContext::new(),
        LOCALHOST,
        server.async_port(),
        server.sync_port(),
        CLIENT_TIMEOUT,
    )
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_sync_ping_pong() {
    let mut server = start_server("it-ping", 2, Duration::from_millis(500));
    let mut client = client_for(&server);

    let reply = client.send_await_response(1, b"PING").unwrap();
    assert_eq!(&reply[..], b"PONG");

    client.close().unwrap();
    server.stop().unwrap();
    assert_eq!(server.dispatch().sync_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sync_roundtrip_is_byte_exact() {
    let mut server = start_server("it-bytes", 2, Duration::from_millis(500));
    let mut client = client_for(&server);

    let all_bytes: Vec<u8> = (0..=255u8).collect();
    let large: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let payloads: Vec<&[u8]> = vec![&b""[..], &b"a"[..], &b"hello world"[..], &all_bytes, &large];

    for payload in payloads {
        let reply = client.send_await_response(7, payload).unwrap();
        let mut expected = payload.to_vec();
        expected.reverse();
        assert_eq!(reply.len(), expected.len());
        assert_eq!(&reply[..], &expected[..]);
    }

    client.close().unwrap();
    server.stop().unwrap();
}

#[test]
fn test_four_threads_ten_async_messages() {
    let mut server = start_server("it-ten", 4, Duration::from_millis(500));
    let mut client = client_for(&server);

    for i in 0..10 {
        client.send(3, format!("msg-{}", i).as_bytes()).unwrap();
    }
    wait_for("ten async calls", || {
        server.dispatch().async_calls.load(Ordering::SeqCst) == 10
    });

    let stopping = Instant::now();
    server.stop().unwrap();
    assert!(stopping.elapsed() < Duration::from_secs(10));
    assert_eq!(server.dispatch().async_calls.load(Ordering::SeqCst), 10);

    client.close().unwrap();
}

#[test]
fn test_async_messages_reach_every_worker() {
    let threads = 4;
    let mut server = start_server("it-cover", threads, Duration::from_millis(500));
    let mut client = client_for(&server);

    for _ in 0..threads * 2 {
        client.send(3, b"work").unwrap();
    }
    wait_for("all async calls", || {
        server.dispatch().async_calls.load(Ordering::SeqCst) == threads * 2
    });

    let workers = server.dispatch().workers.lock().unwrap().clone();
    assert_eq!(workers.len(), threads, "workers seen: {:?}", workers);

    client.close().unwrap();
    server.stop().unwrap();
}

#[test]
fn test_sequence_numbers_reach_handler() {
    let mut server = start_server("it-seq", 1, Duration::from_millis(500));
    let mut client = client_for(&server);

    client.send_sequenced(3, b"ordered", 42).unwrap();
    wait_for("sequenced call", || {
        server.dispatch().async_calls.load(Ordering::SeqCst) == 1
    });
    assert_eq!(*server.dispatch().sequence_nums.lock().unwrap(), vec![42]);

    client.close().unwrap();
    server.stop().unwrap();
}

#[test]
fn test_request_latch_single_steps_processing() {
    let mut server = start_server("it-latch", 2, Duration::from_millis(500));
    let mut client = client_for(&server);

    server.set_request_latch();
    client.send(3, b"first").unwrap();
    server.await_request_latch().unwrap();
    assert_eq!(server.dispatch().async_calls.load(Ordering::SeqCst), 1);

    // Without a latch the next message flows straight through
    client.send(3, b"second").unwrap();
    wait_for("second call", || {
        server.dispatch().async_calls.load(Ordering::SeqCst) == 2
    });

    client.close().unwrap();
    server.stop().unwrap();
}

#[test]
fn test_worker_timeouts_are_not_fatal() {
    let mut server = start_server("it-timeout", 2, Duration::from_millis(20));

    // Let every worker time out a few times
    std::thread::sleep(Duration::from_millis(150));

    let mut client = client_for(&server);
    let reply = client.send_await_response(1, b"PING").unwrap();
    assert_eq!(&reply[..], b"PONG");

    client.send(3, b"after timeout").unwrap();
    wait_for("async call after timeout", || {
        server.dispatch().async_calls.load(Ordering::SeqCst) == 1
    });

    client.close().unwrap();
    // A worker that had failed would make stop report its error
    server.stop().unwrap();
}

#[test]
fn test_stop_is_idempotent_and_releases_ports() {
    let mut server = start_server("it-stop", 3, Duration::from_millis(500));
    let async_port = server.async_port();
    let sync_port = server.sync_port();

    server.stop().unwrap();
    assert!(!server.is_started());
    server.stop().unwrap();

    let ctx = MessageContext::new();
    for port in [async_port, sync_port] {
        let mut rebound = AsyncRecvMessageEndpoint::bind_tcp(&ctx, port, CLIENT_TIMEOUT).unwrap();
        rebound.close().unwrap();
    }
}

#[test]
fn test_many_clients_share_sync_port() {
    let mut server = start_server("it-clients", 3, Duration::from_millis(500));
    let async_port = server.async_port();
    let sync_port = server.sync_port();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            std::thread::spawn(move || {
                let mut client = MessageEndpointClient::with_context(
                    MessageContext::new(),
                    LOCALHOST,
                    async_port,
                    sync_port,
                    CLIENT_TIMEOUT,
                );
                let payload = format!("client-{}", i);
                let reply = client.send_await_response(2, payload.as_bytes()).unwrap();
                let mut expected = payload.into_bytes();
                expected.reverse();
                assert_eq!(&reply[..], &expected[..]);
                client.close().unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    server.stop().unwrap();
    assert_eq!(server.dispatch().sync_calls.load(Ordering::SeqCst), 6);
}

#[test]
fn test_dropping_started_server_stops_it() {
    let async_port = {
        let server = start_server("it-drop", 2, Duration::from_millis(500));
        server.async_port()
    };

    // Port is free again once the server is gone
    let ctx = MessageContext::new();
    let mut rebound = AsyncRecvMessageEndpoint::bind_tcp(&ctx, async_port, CLIENT_TIMEOUT).unwrap();
    rebound.close().unwrap();
}

#[test]
fn test_stop_right_after_sends_handles_every_message() {
    let mut server = start_server("it-immediate", 4, Duration::from_millis(500));
    let mut client = client_for(&server);

    for i in 0..10 {
        client.send(3, format!("msg-{}", i).as_bytes()).unwrap();
    }
    server.stop().unwrap();
    assert_eq!(server.dispatch().async_calls.load(Ordering::SeqCst), 10);

    client.close().unwrap();
}

#[test]
fn test_malformed_async_message_fails_stop() {
    let config = ServerConfig::new("it-malformed", 0, 0)
        .with_threads(1)
        .with_timeout(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_secs(1));
    let mut server = start_server_with(config, Recorder::default());

    let ctx = MessageContext::new();
    let mut raw = MessageEndpoint::open(
        &ctx,
        Address::tcp(LOCALHOST, server.async_port()),
        SocketType::Push,
        ConnectType::Connect,
        CLIENT_TIMEOUT,
    )
    .unwrap();
    // A three-byte header cannot be decoded
    raw.send(b"abc", true).unwrap();
    raw.send(b"body", false).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    let err = server.stop().unwrap_err();
    assert!(
        matches!(err, TransportError::UnexpectedStatus { .. }),
        "unexpected error: {}",
        err
    );
    assert!(!server.is_started());
    assert_eq!(server.dispatch().async_calls.load(Ordering::SeqCst), 0);

    raw.close().unwrap();
}

#[test]
fn test_slow_worker_teardown_does_not_abort_later_rounds() {
    let config = ServerConfig::new("it-slow-stop", 0, 0)
        .with_threads(2)
        .with_timeout(Duration::from_millis(500))
        .with_shutdown_timeout(Duration::from_millis(300));
    let recorder = Recorder {
        first_stop_delay: Duration::from_millis(600),
        ..Default::default()
    };
    let mut server = start_server_with(config, recorder);

    let stopping = Instant::now();
    let err = server.stop().unwrap_err();
    assert!(
        matches!(err, TransportError::LatchTimeout(_)),
        "unexpected error: {}",
        err
    );
    assert!(stopping.elapsed() < Duration::from_secs(5));
    // Rounds after the slow one still reached the other three workers
    assert_eq!(server.dispatch().stops.load(Ordering::SeqCst), 4);
}

#[test]
fn test_hung_worker_teardown_bounds_stop() {
    let config = ServerConfig::new("it-hung-stop", 0, 0)
        .with_threads(1)
        .with_timeout(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_millis(200));
    let recorder = Recorder {
        first_stop_delay: Duration::from_secs(3),
        ..Default::default()
    };
    let mut server = start_server_with(config, recorder);

    let stopping = Instant::now();
    assert!(server.stop().is_err());
    assert!(stopping.elapsed() < Duration::from_secs(3));
    assert!(!server.is_started());
}

#[test]
fn test_late_reply_is_not_returned_for_next_request() {
    let config = ServerConfig::new("it-late", 0, 0)
        .with_threads(2)
        .with_timeout(Duration::from_millis(500));
    let recorder = Recorder {
        slow_request: Duration::from_millis(1000),
        ..Default::default()
    };
    let mut server = start_server_with(config, recorder);

    let mut client = MessageEndpointClient::with_context(
        MessageContext::new(),
        LOCALHOST,
        server.async_port(),
        server.sync_port(),
        Duration::from_millis(300),
    );

    let err = client.send_await_response(1, b"slow").unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)), "unexpected error: {}", err);

    let reply = client.send_await_response(1, b"abc").unwrap();
    assert_eq!(&reply[..], b"cba");

    // Once the slow reply has been sent it still must not surface
    std::thread::sleep(Duration::from_millis(1000));
    let reply = client.send_await_response(1, b"xyz").unwrap();
    assert_eq!(&reply[..], b"zyx");

    client.close().unwrap();
    server.stop().unwrap();
}

#[test]
fn test_request_latch_timeout_keeps_worker_alive() {
    let config = ServerConfig::new("it-latch-timeout", 0, 0)
        .with_threads(1)
        .with_timeout(Duration::from_millis(500))
        .with_latch_timeout(Duration::from_millis(100));
    let mut server = start_server_with(config, Recorder::default());
    let mut client = client_for(&server);

    server.set_request_latch();
    client.send(3, b"first").unwrap();
    wait_for("first call", || {
        server.dispatch().async_calls.load(Ordering::SeqCst) == 1
    });

    // The worker gives up on the latch long before anyone waits on it
    std::thread::sleep(Duration::from_millis(300));
    server.await_request_latch().unwrap();

    client.send(3, b"second").unwrap();
    wait_for("second call", || {
        server.dispatch().async_calls.load(Ordering::SeqCst) == 2
    });

    client.close().unwrap();
    server.stop().unwrap();
}
