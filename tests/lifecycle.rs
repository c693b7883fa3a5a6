use quicharness::api::{
    AddressFamily, ConnectionEvent, StreamHandle, SHUTDOWN_FLAG_NONE,
    STREAM_OPEN_FLAG_UNIDIRECTIONAL,
};
use quicharness::config::HarnessConfig;
use quicharness::connection::{NewStreamHandler, TestConnection};
use quicharness::failure::FailureRecorder;
use quicharness::sim::SimDriver;
use quicharness::{Status, TestStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn noop_stream_handler() -> NewStreamHandler {
    Box::new(|_, _, _| {})
}

fn client_with_config(
    driver: &Arc<SimDriver>,
    config: HarnessConfig,
) -> (Arc<TestConnection>, Arc<FailureRecorder>) {
    let recorder = Arc::new(FailureRecorder::new());
    let conn = TestConnection::new_client(
        driver.clone(),
        driver.registration(),
        noop_stream_handler(),
        false,
        false,
        config,
    )
    .unwrap();
    conn.set_failure_sink(recorder.clone());
    (conn, recorder)
}

fn client(driver: &Arc<SimDriver>) -> (Arc<TestConnection>, Arc<FailureRecorder>) {
    client_with_config(driver, HarnessConfig::default())
}

fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn client_handshake_completes() {
    init_logging();
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);

    assert_eq!(
        conn.start(AddressFamily::Inet, "localhost", 4433),
        Status::Success
    );
    assert!(conn.is_started());
    assert!(driver.started(conn.handle()));

    driver.post(
        conn.handle(),
        ConnectionEvent::Connected {
            session_resumed: false,
        },
    );
    assert!(conn.wait_for_connection_complete());
    assert!(conn.is_connected());
    assert!(!conn.is_resumed());
    assert!(recorder.is_empty());
}

#[test]
fn expected_resumption_violation_is_reported() {
    init_logging();
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);
    conn.set_expected_resumed(true);

    driver.post(
        conn.handle(),
        ConnectionEvent::Connected {
            session_resumed: false,
        },
    );
    assert!(conn.wait_for_connection_complete());
    assert!(recorder.contains("Resumption was expected!"));
}

#[test]
fn resumed_handshake_records_resumption() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);
    conn.set_expected_resumed(true);

    driver.post(
        conn.handle(),
        ConnectionEvent::Connected {
            session_resumed: true,
        },
    );
    assert!(conn.wait_for_connection_complete());
    assert!(conn.is_resumed());
    assert!(recorder.is_empty());
}

#[test]
fn peer_close_with_matching_code() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);
    conn.set_expected_peer_close_error_code(0x42);

    driver.post(
        conn.handle(),
        ConnectionEvent::ShutdownInitiatedByPeer { error_code: 0x42 },
    );
    assert!(conn.wait_for_peer_close());
    assert!(conn.wait_for_connection_complete());
    assert!(conn.peer_closed());
    assert_eq!(conn.peer_close_error_code(), 0x42);
    assert!(recorder.is_empty());
}

#[test]
fn peer_close_with_unexpected_code_is_reported() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);
    conn.set_expected_peer_close_error_code(0x42);

    driver.post(
        conn.handle(),
        ConnectionEvent::ShutdownInitiatedByPeer { error_code: 0x43 },
    );
    assert!(conn.wait_for_peer_close());
    assert_eq!(conn.peer_close_error_code(), 0x43);
    assert!(recorder.contains("Unexpected app close error code"));
}

#[test]
fn transport_close_records_status() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);
    conn.set_expected_transport_close_status(Status::ConnectionIdle);

    driver.post(
        conn.handle(),
        ConnectionEvent::ShutdownInitiatedByTransport {
            status: Status::ConnectionIdle,
        },
    );
    assert!(conn.wait_for_connection_complete());
    assert!(conn.transport_closed());
    assert_eq!(conn.transport_close_status(), Status::ConnectionIdle);
    assert!(recorder.is_empty());
}

#[test]
fn transport_close_with_unexpected_status_is_reported() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);

    driver.post(
        conn.handle(),
        ConnectionEvent::ShutdownInitiatedByTransport {
            status: Status::ConnectionTimeout,
        },
    );
    assert!(conn.wait_for_connection_complete());
    assert!(recorder.contains("Unexpected transport close status"));
}

#[test]
fn shutdown_complete_records_terminal_state() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);
    let callback_ran = Arc::new(AtomicBool::new(false));
    let flag = callback_ran.clone();
    conn.set_shutdown_complete_callback(Box::new(move |_| {
        flag.store(true, Ordering::SeqCst);
    }));

    assert_eq!(
        conn.start(AddressFamily::Inet, "localhost", 4433),
        Status::Success
    );
    driver.post(
        conn.handle(),
        ConnectionEvent::ShutdownComplete {
            peer_acknowledged: false,
        },
    );
    assert!(conn.wait_for_shutdown_complete());
    assert!(conn.is_shutdown());
    assert!(conn.shutdown_timed_out());
    assert!(wait_until(
        || callback_ran.load(Ordering::SeqCst),
        Duration::from_secs(2)
    ));
    assert!(recorder.is_empty());
}

#[test]
fn shutdown_wait_without_start_returns_immediately() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);

    let start = Instant::now();
    assert!(conn.wait_for_shutdown_complete());
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(recorder.is_empty());
}

#[test]
fn wait_timeout_reports_failure() {
    let driver = SimDriver::new();
    let config = HarnessConfig {
        wait_timeout_ms: 250,
        ..HarnessConfig::default()
    };
    let (conn, recorder) = client_with_config(&driver, config);

    let start = Instant::now();
    assert!(!conn.wait_for_connection_complete());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_secs(1));
    assert!(recorder.contains("wait_for_connection_complete timed out"));
}

#[test]
fn auto_delete_server_releases_fixture() {
    init_logging();
    let driver = SimDriver::new();
    let accepted = driver.accept();
    let conn = TestConnection::new_server(
        driver.clone(),
        accepted,
        noop_stream_handler(),
        true,
        HarnessConfig::default(),
    );
    let weak = Arc::downgrade(&conn);
    drop(conn);

    // Still alive: the fixture owns itself until the terminal event.
    assert!(weak.upgrade().is_some());

    driver.post(
        accepted,
        ConnectionEvent::ShutdownComplete {
            peer_acknowledged: true,
        },
    );
    assert!(wait_until(
        || weak.upgrade().is_none(),
        Duration::from_secs(2)
    ));
    assert_eq!(driver.close_count(accepted), 1);
}

#[test]
fn shutdown_complete_callback_runs_before_auto_delete_release() {
    let driver = SimDriver::new();
    let accepted = driver.accept();
    let conn = TestConnection::new_server(
        driver.clone(),
        accepted,
        noop_stream_handler(),
        true,
        HarnessConfig::default(),
    );
    let callback_ran = Arc::new(AtomicBool::new(false));
    let flag = callback_ran.clone();
    conn.set_shutdown_complete_callback(Box::new(move |fixture| {
        assert!(fixture.is_shutdown());
        flag.store(true, Ordering::SeqCst);
    }));
    let weak = Arc::downgrade(&conn);
    drop(conn);

    driver.post(
        accepted,
        ConnectionEvent::ShutdownComplete {
            peer_acknowledged: true,
        },
    );
    assert!(wait_until(
        || weak.upgrade().is_none(),
        Duration::from_secs(2)
    ));
    assert!(callback_ran.load(Ordering::SeqCst));
}

#[test]
fn fixture_drop_closes_handle_once() {
    let driver = SimDriver::new();
    let (conn, _recorder) = client(&driver);
    let handle = conn.handle();
    drop(conn);
    assert_eq!(driver.close_count(handle), 1);
}

#[test]
fn shutdown_forwards_flags_and_error_code() {
    let driver = SimDriver::new();
    let (conn, _recorder) = client(&driver);
    conn.shutdown(SHUTDOWN_FLAG_NONE, 77);
    assert_eq!(
        driver.shutdown_calls(conn.handle()),
        vec![(SHUTDOWN_FLAG_NONE, 77)]
    );
}

#[test]
fn connection_open_failure_surfaces_status() {
    let driver = SimDriver::new();
    driver.fail_connection_open(Status::Aborted);
    let result = TestConnection::new_client(
        driver.clone(),
        driver.registration(),
        noop_stream_handler(),
        false,
        false,
        HarnessConfig::default(),
    );
    assert_eq!(result.err(), Some(Status::Aborted));
}

#[test]
fn peer_stream_started_invokes_callback_inline() {
    let driver = SimDriver::new();
    let seen: Arc<Mutex<Vec<StreamHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: NewStreamHandler = Box::new(move |conn, stream, flags| {
        // Adopt the handle; dropping the wrapper at the end of the
        // callback closes it.
        let adopted =
            TestStream::from_peer_handle(Arc::clone(conn.driver()), stream, flags, None);
        assert!(adopted.is_unidirectional());
        sink.lock().unwrap().push(adopted.handle());
    });
    let recorder = Arc::new(FailureRecorder::new());
    let conn = TestConnection::new_client(
        driver.clone(),
        driver.registration(),
        handler,
        false,
        false,
        HarnessConfig::default(),
    )
    .unwrap();
    conn.set_failure_sink(recorder.clone());

    let stream = driver.peer_stream();
    driver.deliver(
        conn.handle(),
        ConnectionEvent::PeerStreamStarted {
            stream: Some(stream),
            flags: STREAM_OPEN_FLAG_UNIDIRECTIONAL,
        },
    );
    assert_eq!(*seen.lock().unwrap(), vec![stream]);
    assert_eq!(driver.stream_close_count(stream), 1);
    assert!(recorder.is_empty());
}

#[test]
fn null_peer_stream_handle_is_reported() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);
    driver.deliver(
        conn.handle(),
        ConnectionEvent::PeerStreamStarted {
            stream: None,
            flags: 0,
        },
    );
    assert!(recorder.contains("Null stream"));
}

#[test]
fn first_terminal_event_wins_connection_complete() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);

    driver.deliver(
        conn.handle(),
        ConnectionEvent::Connected {
            session_resumed: false,
        },
    );
    driver.deliver(
        conn.handle(),
        ConnectionEvent::ShutdownInitiatedByPeer { error_code: 0 },
    );

    assert!(conn.wait_for_connection_complete());
    assert!(conn.wait_for_peer_close());
    assert!(conn.is_connected());
    assert!(conn.peer_closed());
    assert!(recorder.is_empty());
}

#[test]
fn unrecognized_events_are_ignored() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);

    driver.deliver(
        conn.handle(),
        ConnectionEvent::StreamsAvailable { bidi: 4, unidi: 2 },
    );
    driver.deliver(
        conn.handle(),
        ConnectionEvent::DatagramStateChanged {
            send_enabled: true,
            max_send_length: 1200,
        },
    );
    driver.deliver(
        conn.handle(),
        ConnectionEvent::IdealProcessorChanged { processor: 3 },
    );

    assert!(!conn.is_connected());
    assert!(!conn.peer_closed());
    assert!(!conn.transport_closed());
    assert!(!conn.is_shutdown());
    assert!(recorder.is_empty());
}

#[test]
fn peer_address_change_is_sticky() {
    let driver = SimDriver::new();
    let (conn, _recorder) = client(&driver);
    let new_addr = "127.0.0.1:9999".parse().unwrap();

    assert!(!conn.peer_addr_changed());
    driver.deliver(
        conn.handle(),
        ConnectionEvent::PeerAddressChanged { new_addr },
    );
    assert!(conn.peer_addr_changed());
    driver.deliver(
        conn.handle(),
        ConnectionEvent::PeerAddressChanged { new_addr },
    );
    assert!(conn.peer_addr_changed());
}

#[test]
fn new_stream_transfers_ownership_to_caller() {
    let driver = SimDriver::new();
    let (conn, recorder) = client(&driver);

    let stream = conn.new_stream(None, 0).unwrap();
    let handle = stream.handle();
    drop(stream);
    assert_eq!(driver.stream_close_count(handle), 1);
    assert!(recorder.is_empty());
}

#[test]
fn context_slot_round_trips() {
    let driver = SimDriver::new();
    let (conn, _recorder) = client(&driver);
    conn.set_context(Box::new(41u32));
    let ctx = conn.take_context().unwrap();
    assert_eq!(*ctx.downcast::<u32>().unwrap(), 41);
    assert!(conn.take_context().is_none());
}
