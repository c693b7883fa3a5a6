//! # Driver Seam
//!
//! The underlying QUIC library, reduced to the calls and events the harness
//! consumes. A production binding implements [`ConnectionDriver`] over the
//! real stack; the crate's own tests use the scriptable in-memory driver
//! from the `sim` module.

use std::net::SocketAddr;
use std::sync::Weak;

use crate::error::Status;
use crate::params::ParamKey;

/// Opaque handle to a registration, the parent object connections are
/// opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(pub u64);

/// Opaque handle to a single connection inside the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Opaque handle to a single stream inside the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Address family selector for `connection_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unspecified,
    Inet,
    Inet6,
}

pub const SHUTDOWN_FLAG_NONE: u32 = 0x0;
pub const SHUTDOWN_FLAG_SILENT: u32 = 0x1;

pub const STREAM_OPEN_FLAG_NONE: u32 = 0x0;
pub const STREAM_OPEN_FLAG_UNIDIRECTIONAL: u32 = 0x1;
pub const STREAM_OPEN_FLAG_ZERO_RTT: u32 = 0x2;

/// Events delivered on the driver's event thread.
///
/// The harness recognizes the first six kinds; everything else is accepted
/// and ignored by the dispatcher.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected {
        session_resumed: bool,
    },
    ShutdownInitiatedByTransport {
        status: Status,
    },
    ShutdownInitiatedByPeer {
        error_code: u64,
    },
    ShutdownComplete {
        peer_acknowledged: bool,
    },
    PeerAddressChanged {
        new_addr: SocketAddr,
    },
    /// Carries the new stream's handle; the receiver takes ownership of it.
    /// `None` models a null handle from a misbehaving driver.
    PeerStreamStarted {
        stream: Option<StreamHandle>,
        flags: u32,
    },
    StreamsAvailable {
        bidi: u16,
        unidi: u16,
    },
    DatagramStateChanged {
        send_enabled: bool,
        max_send_length: u16,
    },
    IdealProcessorChanged {
        processor: u16,
    },
}

/// Receiver side of a connection's event stream.
///
/// Dispatch contract: the driver holds a strong reference to the handler
/// for the whole duration of the call. Handlers rely on this to release
/// their own last owning reference from inside a callback.
pub trait ConnectionEventHandler: Send + Sync {
    fn handle_event(&self, event: ConnectionEvent) -> Status;
}

/// The underlying QUIC library as the harness sees it.
///
/// Implementations synchronize internally; the harness calls into the
/// driver from both the test thread and the driver's own event thread.
pub trait ConnectionDriver: Send + Sync {
    /// Open a fresh client connection under `registration`.
    fn connection_open(
        &self,
        registration: RegistrationHandle,
    ) -> Result<ConnectionHandle, Status>;

    /// Attach the event handler for `conn`. The driver stores the weak
    /// reference and upgrades it per dispatch.
    fn set_callback_handler(
        &self,
        conn: ConnectionHandle,
        handler: Weak<dyn ConnectionEventHandler>,
    );

    /// Start the handshake toward `server_name:port`. Port is in host byte
    /// order.
    fn connection_start(
        &self,
        conn: ConnectionHandle,
        family: AddressFamily,
        server_name: &str,
        port: u16,
    ) -> Status;

    /// Begin an application-initiated shutdown. Fire and forget.
    fn connection_shutdown(&self, conn: ConnectionHandle, flags: u32, error_code: u64);

    /// Release the connection handle. Idempotent at the driver boundary.
    fn connection_close(&self, conn: ConnectionHandle);

    /// Write an encoded parameter value.
    fn set_param(&self, conn: ConnectionHandle, key: ParamKey, value: &[u8]) -> Status;

    /// Read an encoded parameter value into `buf`. `len` carries the
    /// caller's capacity in and the value's size out; a too-small buffer
    /// (including a zero-length probe) answers `BufferTooSmall` with `len`
    /// set to the required size.
    fn get_param(
        &self,
        conn: ConnectionHandle,
        key: ParamKey,
        buf: &mut [u8],
        len: &mut usize,
    ) -> Status;

    /// Open a local stream on `conn`.
    fn stream_open(&self, conn: ConnectionHandle, flags: u32) -> Result<StreamHandle, Status>;

    /// Release a stream handle.
    fn stream_close(&self, stream: StreamHandle);
}
