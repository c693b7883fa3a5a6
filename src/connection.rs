// Copyright (c) 2024, The QuicHarness Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Connection Fixture
//!
//! This module provides the central `TestConnection` struct: a
//! synchronous-feeling wrapper around one driver connection. The driver's
//! event callbacks land in the fixture's dispatcher, which records
//! monotonic state and signals waitable milestones; test code blocks on
//! those milestones and inspects the recorded fields afterwards.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{
    AddressFamily, ConnectionDriver, ConnectionEvent, ConnectionEventHandler, ConnectionHandle,
    RegistrationHandle, StreamHandle,
};
use crate::config::HarnessConfig;
use crate::error::Status;
use crate::failure::{self, FailureSink};
use crate::params::{
    self, ConnectionStatistics, ParamKey, PrivateTransportParameter, SecurityConfig,
    StreamSchedulingScheme, CERT_FLAG_IGNORE_CERTIFICATE_CN_INVALID, CERT_FLAG_IGNORE_UNKNOWN_CA,
};
use crate::stream::{StreamShutdownHandler, TestStream};
use crate::sync::ManualResetEvent;

const ZERO_RTT_POLL_TRIES: u32 = 20;
const ZERO_RTT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on any encoded parameter payload.
const PARAM_BUF_CAPACITY: usize = 512;

/// Which side of the connection the fixture wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Invoked inline from the dispatcher for every peer-started stream. The
/// callback takes ownership of the stream handle, typically by wrapping it
/// in [`TestStream::from_peer_handle`].
pub type NewStreamHandler = Box<dyn Fn(&TestConnection, StreamHandle, u32) + Send + Sync>;

/// Invoked inline from the dispatcher once the terminal event arrives,
/// before an auto-delete fixture releases itself.
pub type ShutdownCompleteHandler = Box<dyn Fn(&TestConnection) + Send + Sync>;

/// Wraps exactly one driver connection for its lifetime.
///
/// Two threads interact with a fixture: the driver's event thread, which
/// is the sole writer of lifecycle state, and the test thread, which calls
/// accessors and waits. State fields are set-once from `false`, so a field
/// observed after its milestone signal is stable without further locking.
pub struct TestConnection {
    driver: Arc<dyn ConnectionDriver>,
    conn: ConnectionHandle,
    role: Role,
    config: HarnessConfig,
    auto_delete: bool,

    started: AtomicBool,
    connected: AtomicBool,
    resumed: AtomicBool,
    peer_addr_changed: AtomicBool,
    peer_closed: AtomicBool,
    transport_closed: AtomicBool,
    is_shutdown: AtomicBool,
    shutdown_timed_out: AtomicBool,

    peer_close_error_code: AtomicU64,
    transport_close_status: AtomicU32,

    expected_resumed: AtomicBool,
    expected_transport_close_status: AtomicU32,
    expected_peer_close_error_code: AtomicU64,

    connection_complete: ManualResetEvent,
    peer_closed_signal: ManualResetEvent,
    shutdown_complete: ManualResetEvent,

    new_stream_callback: NewStreamHandler,
    shutdown_complete_callback: Mutex<Option<ShutdownCompleteHandler>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    failure_sink: Mutex<Option<Arc<dyn FailureSink>>>,

    // Self-owning reference held while an auto-delete fixture is live; the
    // dispatcher takes it out on the shutdown-complete event.
    keepalive: Mutex<Option<Arc<TestConnection>>>,
}

impl TestConnection {
    /// Open a fresh client connection under `registration`. Send buffering
    /// is applied once here; the certificate-validation default accepts
    /// self-signed test certificates.
    pub fn new_client(
        driver: Arc<dyn ConnectionDriver>,
        registration: RegistrationHandle,
        on_peer_stream: NewStreamHandler,
        auto_delete: bool,
        use_send_buffer: bool,
        config: HarnessConfig,
    ) -> Result<Arc<Self>, Status> {
        let conn = match driver.connection_open(registration) {
            Ok(handle) => handle,
            Err(status) => {
                failure::report(format_args!("connection_open failed, {}", status));
                return Err(status);
            }
        };
        let fixture = Arc::new(Self::with_handle(
            driver,
            conn,
            Role::Client,
            on_peer_stream,
            auto_delete,
            config,
        ));
        fixture.register();

        let status = fixture.set_param_typed(ParamKey::SendBuffering, &use_send_buffer);
        if status.failed() {
            fixture.fail(format_args!("set_param(SendBuffering) failed, {}", status));
        }
        fixture.apply_default_cert_flags();
        Ok(fixture)
    }

    /// Adopt an already-accepted server-side handle. Servers are considered
    /// started on accept and skip the `start` step.
    pub fn new_server(
        driver: Arc<dyn ConnectionDriver>,
        accepted: ConnectionHandle,
        on_peer_stream: NewStreamHandler,
        auto_delete: bool,
        config: HarnessConfig,
    ) -> Arc<Self> {
        let fixture = Arc::new(Self::with_handle(
            driver,
            accepted,
            Role::Server,
            on_peer_stream,
            auto_delete,
            config,
        ));
        fixture.register();
        fixture.apply_default_cert_flags();
        fixture
    }

    fn with_handle(
        driver: Arc<dyn ConnectionDriver>,
        conn: ConnectionHandle,
        role: Role,
        on_peer_stream: NewStreamHandler,
        auto_delete: bool,
        config: HarnessConfig,
    ) -> Self {
        Self {
            driver,
            conn,
            role,
            config,
            auto_delete,
            started: AtomicBool::new(role == Role::Server),
            connected: AtomicBool::new(false),
            resumed: AtomicBool::new(false),
            peer_addr_changed: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            is_shutdown: AtomicBool::new(false),
            shutdown_timed_out: AtomicBool::new(false),
            peer_close_error_code: AtomicU64::new(0),
            transport_close_status: AtomicU32::new(Status::Success.code()),
            expected_resumed: AtomicBool::new(false),
            expected_transport_close_status: AtomicU32::new(Status::Success.code()),
            expected_peer_close_error_code: AtomicU64::new(0),
            connection_complete: ManualResetEvent::new(),
            peer_closed_signal: ManualResetEvent::new(),
            shutdown_complete: ManualResetEvent::new(),
            new_stream_callback: on_peer_stream,
            shutdown_complete_callback: Mutex::new(None),
            context: Mutex::new(None),
            failure_sink: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    fn register(self: &Arc<Self>) {
        if self.auto_delete {
            *self.keepalive.lock().unwrap() = Some(Arc::clone(self));
        }
        let handler_arc: Arc<dyn ConnectionEventHandler> = Arc::clone(self) as Arc<dyn ConnectionEventHandler>;
        let handler: Weak<dyn ConnectionEventHandler> = Arc::downgrade(&handler_arc);
        self.driver.set_callback_handler(self.conn, handler);
    }

    fn apply_default_cert_flags(&self) {
        // Test certificates are self-signed, so the root cannot validate.
        let _ = self.set_cert_validation_flags(
            CERT_FLAG_IGNORE_UNKNOWN_CA | CERT_FLAG_IGNORE_CERTIFICATE_CN_INVALID,
        );
    }

    /// Start the client handshake. `port` is in host byte order.
    pub fn start(&self, family: AddressFamily, server_name: &str, port: u16) -> Status {
        let status = self.driver.connection_start(self.conn, family, server_name, port);
        if status.succeeded() {
            self.started.store(true, Ordering::Release);
        }
        status
    }

    /// Begin an application-initiated shutdown. Fire and forget; completion
    /// arrives as the shutdown-complete event.
    pub fn shutdown(&self, flags: u32, error_code: u64) {
        self.driver.connection_shutdown(self.conn, flags, error_code);
    }

    /// Allocate a local stream. Ownership of the returned stream transfers
    /// to the caller; the fixture holds no references to it.
    pub fn new_stream(
        &self,
        shutdown_handler: Option<StreamShutdownHandler>,
        flags: u32,
    ) -> Result<TestStream, Status> {
        TestStream::from_connection_handle(
            Arc::clone(&self.driver),
            self.conn,
            shutdown_handler,
            flags,
        )
    }

    //
    // Wait primitives
    //

    pub fn wait_for_connection_complete(&self) -> bool {
        if !self.connection_complete.wait_timeout(self.config.wait_timeout()) {
            self.fail(format_args!(
                "wait_for_connection_complete timed out after {} ms",
                self.config.wait_timeout_ms
            ));
            return false;
        }
        true
    }

    /// Returns true immediately for fixtures that never started: there is
    /// nothing to wait for.
    pub fn wait_for_shutdown_complete(&self) -> bool {
        if self.started.load(Ordering::Acquire) {
            if !self.shutdown_complete.wait_timeout(self.config.wait_timeout()) {
                self.fail(format_args!(
                    "wait_for_shutdown_complete timed out after {} ms",
                    self.config.wait_timeout_ms
                ));
                return false;
            }
        }
        true
    }

    pub fn wait_for_peer_close(&self) -> bool {
        if !self.peer_closed_signal.wait_timeout(self.config.wait_timeout()) {
            self.fail(format_args!(
                "wait_for_peer_close timed out after {} ms",
                self.config.wait_timeout_ms
            ));
            return false;
        }
        true
    }

    /// The driver raises no event when a resumption ticket arrives, so the
    /// harness polls for one instead.
    pub fn wait_for_zero_rtt_ticket(&self) -> bool {
        let mut tries = 0;
        while tries < ZERO_RTT_POLL_TRIES {
            if self.has_new_zero_rtt_ticket() {
                return true;
            }
            tries += 1;
            thread::sleep(ZERO_RTT_POLL_INTERVAL);
        }
        self.fail(format_args!(
            "wait_for_zero_rtt_ticket failed after {} attempts",
            ZERO_RTT_POLL_TRIES
        ));
        false
    }

    /// A zero-length query answers `BufferTooSmall` exactly when the driver
    /// holds a resumption state worth fetching.
    pub fn has_new_zero_rtt_ticket(&self) -> bool {
        let mut len = 0;
        Status::BufferTooSmall
            == self
                .driver
                .get_param(self.conn, ParamKey::ResumptionState, &mut [], &mut len)
    }

    //
    // State accessors
    //

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.conn
    }

    pub fn driver(&self) -> &Arc<dyn ConnectionDriver> {
        &self.driver
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    pub fn shutdown_timed_out(&self) -> bool {
        self.shutdown_timed_out.load(Ordering::Acquire)
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }

    /// Valid iff [`peer_closed`](Self::peer_closed).
    pub fn peer_close_error_code(&self) -> u64 {
        self.peer_close_error_code.load(Ordering::Acquire)
    }

    pub fn transport_closed(&self) -> bool {
        self.transport_closed.load(Ordering::Acquire)
    }

    /// Valid iff [`transport_closed`](Self::transport_closed).
    pub fn transport_close_status(&self) -> Status {
        Status::from_code(self.transport_close_status.load(Ordering::Acquire))
    }

    pub fn peer_addr_changed(&self) -> bool {
        self.peer_addr_changed.load(Ordering::Acquire)
    }

    //
    // Expectations and callback slots
    //

    pub fn set_expected_resumed(&self, expected: bool) {
        self.expected_resumed.store(expected, Ordering::Release);
    }

    pub fn set_expected_transport_close_status(&self, status: Status) {
        self.expected_transport_close_status
            .store(status.code(), Ordering::Release);
    }

    pub fn set_expected_peer_close_error_code(&self, error_code: u64) {
        self.expected_peer_close_error_code
            .store(error_code, Ordering::Release);
    }

    pub fn set_shutdown_complete_callback(&self, callback: ShutdownCompleteHandler) {
        *self.shutdown_complete_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().unwrap().take()
    }

    /// Route this fixture's failure reports to `sink` instead of the
    /// process-global one.
    pub fn set_failure_sink(&self, sink: Arc<dyn FailureSink>) {
        *self.failure_sink.lock().unwrap() = Some(sink);
    }

    fn fail(&self, args: fmt::Arguments<'_>) {
        let sink = self.failure_sink.lock().unwrap().clone();
        match sink {
            Some(sink) => sink.report(&args.to_string()),
            None => failure::report(args),
        }
    }

    //
    // Parameter accessors
    //

    fn get_param_typed<T: DeserializeOwned>(&self, key: ParamKey) -> Result<T, Status> {
        let mut buf = vec![0u8; PARAM_BUF_CAPACITY];
        let mut len = buf.len();
        let status = self.driver.get_param(self.conn, key, &mut buf, &mut len);
        if status.failed() {
            return Err(status);
        }
        params::decode(&buf[..len])
    }

    fn set_param_typed<T: Serialize>(&self, key: ParamKey, value: &T) -> Status {
        match params::encode(value) {
            Ok(bytes) => self.driver.set_param(self.conn, key, &bytes),
            Err(status) => status,
        }
    }

    fn get_or_default<T: DeserializeOwned + Default>(&self, key: ParamKey, label: &str) -> T {
        match self.get_param_typed(key) {
            Ok(value) => value,
            Err(status) => {
                self.fail(format_args!("get_param({}) failed, {}", label, status));
                T::default()
            }
        }
    }

    /// Retry wrapper for the operations that are only legal once the
    /// handshake is confirmed. Confirmation trails the connected event, so
    /// an `InvalidState` answer right after the handshake is transient.
    fn retry_on_invalid_state<F: Fn() -> Status>(&self, op: F) -> Status {
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            if attempt != 0 {
                thread::sleep(policy.backoff());
            }
            let status = op();
            if status != Status::InvalidState || attempt >= policy.attempts {
                return status;
            }
            attempt += 1;
        }
    }

    pub fn quic_version(&self) -> u32 {
        self.get_or_default(ParamKey::QuicVersion, "QuicVersion")
    }

    pub fn set_quic_version(&self, value: u32) -> Status {
        self.set_param_typed(ParamKey::QuicVersion, &value)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Status> {
        self.get_param_typed(ParamKey::LocalAddress)
    }

    /// Clients may not change address until the handshake is confirmed, so
    /// this setter runs under the retry discipline.
    pub fn set_local_addr(&self, addr: SocketAddr) -> Status {
        self.retry_on_invalid_state(|| self.set_param_typed(ParamKey::LocalAddress, &addr))
    }

    pub fn remote_addr(&self) -> Result<SocketAddr, Status> {
        self.get_param_typed(ParamKey::RemoteAddress)
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) -> Status {
        self.set_param_typed(ParamKey::RemoteAddress, &addr)
    }

    pub fn idle_timeout(&self) -> u64 {
        self.get_or_default(ParamKey::IdleTimeout, "IdleTimeout")
    }

    pub fn set_idle_timeout(&self, value_ms: u64) -> Status {
        self.set_param_typed(ParamKey::IdleTimeout, &value_ms)
    }

    pub fn disconnect_timeout(&self) -> u32 {
        self.get_or_default(ParamKey::DisconnectTimeout, "DisconnectTimeout")
    }

    pub fn set_disconnect_timeout(&self, value_ms: u32) -> Status {
        self.set_param_typed(ParamKey::DisconnectTimeout, &value_ms)
    }

    pub fn peer_bidi_stream_count(&self) -> u16 {
        self.get_or_default(ParamKey::PeerBidiStreamCount, "PeerBidiStreamCount")
    }

    pub fn set_peer_bidi_stream_count(&self, value: u16) -> Status {
        self.set_param_typed(ParamKey::PeerBidiStreamCount, &value)
    }

    pub fn peer_unidi_stream_count(&self) -> u16 {
        self.get_or_default(ParamKey::PeerUnidiStreamCount, "PeerUnidiStreamCount")
    }

    pub fn set_peer_unidi_stream_count(&self, value: u16) -> Status {
        self.set_param_typed(ParamKey::PeerUnidiStreamCount, &value)
    }

    pub fn local_bidi_stream_count(&self) -> u16 {
        self.get_or_default(ParamKey::LocalBidiStreamCount, "LocalBidiStreamCount")
    }

    pub fn local_unidi_stream_count(&self) -> u16 {
        self.get_or_default(ParamKey::LocalUnidiStreamCount, "LocalUnidiStreamCount")
    }

    pub fn statistics(&self) -> ConnectionStatistics {
        self.get_or_default(ParamKey::Statistics, "Statistics")
    }

    pub fn cert_validation_flags(&self) -> u32 {
        self.get_or_default(ParamKey::CertValidationFlags, "CertValidationFlags")
    }

    pub fn set_cert_validation_flags(&self, flags: u32) -> Status {
        self.set_param_typed(ParamKey::CertValidationFlags, &flags)
    }

    pub fn keep_alive(&self) -> u32 {
        self.get_or_default(ParamKey::KeepAlive, "KeepAlive")
    }

    pub fn set_keep_alive(&self, value_ms: u32) -> Status {
        self.set_param_typed(ParamKey::KeepAlive, &value_ms)
    }

    pub fn share_udp_binding(&self) -> bool {
        self.get_or_default(ParamKey::ShareUdpBinding, "ShareUdpBinding")
    }

    pub fn set_share_udp_binding(&self, value: bool) -> Status {
        self.set_param_typed(ParamKey::ShareUdpBinding, &value)
    }

    pub fn stream_scheduling_scheme(&self) -> StreamSchedulingScheme {
        self.get_or_default(ParamKey::StreamSchedulingScheme, "StreamSchedulingScheme")
    }

    pub fn set_stream_scheduling_scheme(&self, scheme: StreamSchedulingScheme) -> Status {
        self.set_param_typed(ParamKey::StreamSchedulingScheme, &scheme)
    }

    pub fn set_security_config(&self, config: SecurityConfig) -> Status {
        self.set_param_typed(ParamKey::SecurityConfig, &config)
    }

    pub fn set_test_transport_parameter(&self, param: &PrivateTransportParameter) -> Status {
        self.set_param_typed(ParamKey::TestTransportParameter, param)
    }

    /// Forcing a key update is only allowed once the handshake is
    /// confirmed; runs under the retry discipline.
    pub fn force_key_update(&self) -> Status {
        self.retry_on_invalid_state(|| {
            self.driver.set_param(self.conn, ParamKey::ForceKeyUpdate, &[])
        })
    }

    /// Forcing a CID update is only allowed once the handshake is
    /// confirmed; runs under the retry discipline.
    pub fn force_cid_update(&self) -> Status {
        self.retry_on_invalid_state(|| {
            self.driver.set_param(self.conn, ParamKey::ForceCidUpdate, &[])
        })
    }
}

impl ConnectionEventHandler for TestConnection {
    /// The dispatcher: sole writer of fixture state after construction.
    /// Runs on the driver's event thread, never blocks on a fixture-owned
    /// waitable, and never vetoes an event.
    fn handle_event(&self, event: ConnectionEvent) -> Status {
        match event {
            ConnectionEvent::Connected { session_resumed } => {
                debug!("connected, resumed={}", session_resumed);
                self.connected.store(true, Ordering::Release);
                self.resumed.store(session_resumed, Ordering::Release);
                if !session_resumed && self.expected_resumed.load(Ordering::Acquire) {
                    self.fail(format_args!("Resumption was expected!"));
                }
                self.connection_complete.set();
            }
            ConnectionEvent::ShutdownInitiatedByTransport { status } => {
                self.transport_closed.store(true, Ordering::Release);
                self.transport_close_status
                    .store(status.code(), Ordering::Release);
                if status.code() != self.expected_transport_close_status.load(Ordering::Acquire) {
                    self.fail(format_args!("Unexpected transport close status, {}", status));
                }
                self.connection_complete.set();
            }
            ConnectionEvent::ShutdownInitiatedByPeer { error_code } => {
                self.peer_closed.store(true, Ordering::Release);
                self.peer_close_error_code
                    .store(error_code, Ordering::Release);
                if error_code != self.expected_peer_close_error_code.load(Ordering::Acquire) {
                    self.fail(format_args!("Unexpected app close error code, {}", error_code));
                }
                self.connection_complete.set();
                self.peer_closed_signal.set();
            }
            ConnectionEvent::ShutdownComplete { peer_acknowledged } => {
                debug!("shutdown complete, peer_acknowledged={}", peer_acknowledged);
                self.is_shutdown.store(true, Ordering::Release);
                self.shutdown_timed_out
                    .store(!peer_acknowledged, Ordering::Release);
                self.shutdown_complete.set();
                let callback = self.shutdown_complete_callback.lock().unwrap().take();
                if let Some(callback) = callback {
                    callback(self);
                }
                // The dispatch site holds a strong reference for the
                // duration of this call, so taking the self-owning one here
                // lets the fixture go away on the event thread as soon as
                // the handler returns.
                if self.auto_delete {
                    self.keepalive.lock().unwrap().take();
                }
            }
            ConnectionEvent::PeerAddressChanged { .. } => {
                self.peer_addr_changed.store(true, Ordering::Release);
            }
            ConnectionEvent::PeerStreamStarted { stream, flags } => match stream {
                Some(handle) => (self.new_stream_callback)(self, handle, flags),
                None => self.fail(format_args!("Null stream handle in peer stream event")),
            },
            _ => {}
        }
        Status::Success
    }
}

impl Drop for TestConnection {
    fn drop(&mut self) {
        self.driver.connection_close(self.conn);
    }
}
