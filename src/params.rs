//! Typed views over the driver's untyped key-value parameter interface.
//!
//! Values cross the seam as bincode payloads; [`encode`] and [`decode`]
//! define the ABI both for the harness accessors and for driver
//! implementations.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Status;

/// Connection-level parameter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    QuicVersion,
    LocalAddress,
    RemoteAddress,
    IdleTimeout,
    DisconnectTimeout,
    PeerBidiStreamCount,
    PeerUnidiStreamCount,
    LocalBidiStreamCount,
    LocalUnidiStreamCount,
    Statistics,
    CertValidationFlags,
    KeepAlive,
    ShareUdpBinding,
    StreamSchedulingScheme,
    SecurityConfig,
    TestTransportParameter,
    SendBuffering,
    ForceKeyUpdate,
    ForceCidUpdate,
    ResumptionState,
}

pub const CERT_FLAG_IGNORE_UNKNOWN_CA: u32 = 0x0001;
pub const CERT_FLAG_IGNORE_CERTIFICATE_CN_INVALID: u32 = 0x0002;

/// How the driver schedules ready streams onto the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamSchedulingScheme {
    #[default]
    Fifo,
    RoundRobin,
}

/// Point-in-time transfer counters reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatistics {
    pub rtt_us: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub handshake_time_ms: Option<u64>,
}

/// Opaque security configuration handle. Set-only: the driver resolves the
/// handle internally, the harness never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig(pub u64);

/// Test hook: a raw transport parameter smuggled into the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateTransportParameter {
    pub id: u16,
    pub value: Vec<u8>,
}

/// Encode a parameter payload with the seam's wire codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Status> {
    bincode::serialize(value).map_err(|_| Status::InternalError)
}

/// Decode a parameter payload read back from the driver.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Status> {
    bincode::deserialize(bytes).map_err(|_| Status::InternalError)
}
