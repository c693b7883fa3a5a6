use thiserror::Error;

/// Status codes surfaced by the connection driver.
///
/// The harness passes these through unchanged: setters hand them straight
/// back to the caller and the dispatcher records them as terminal state.
/// Only `InvalidState` receives special treatment, inside the bounded-retry
/// wrapper for post-handshake operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Status {
    #[error("success")]
    Success,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid state")]
    InvalidState,
    #[error("not supported")]
    NotSupported,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("aborted")]
    Aborted,
    #[error("connection idle")]
    ConnectionIdle,
    #[error("connection timeout")]
    ConnectionTimeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("internal error")]
    InternalError,
}

impl Status {
    pub fn succeeded(self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn failed(self) -> bool {
        !self.succeeded()
    }

    /// Stable numeric code, used where a status has to live in an atomic
    /// field or cross the untyped parameter interface.
    pub fn code(self) -> u32 {
        match self {
            Status::Success => 0,
            Status::InvalidParameter => 1,
            Status::InvalidState => 2,
            Status::NotSupported => 3,
            Status::BufferTooSmall => 4,
            Status::Aborted => 5,
            Status::ConnectionIdle => 6,
            Status::ConnectionTimeout => 7,
            Status::ConnectionRefused => 8,
            Status::InternalError => 9,
        }
    }

    pub fn from_code(code: u32) -> Status {
        match code {
            0 => Status::Success,
            1 => Status::InvalidParameter,
            2 => Status::InvalidState,
            3 => Status::NotSupported,
            4 => Status::BufferTooSmall,
            5 => Status::Aborted,
            6 => Status::ConnectionIdle,
            7 => Status::ConnectionTimeout,
            8 => Status::ConnectionRefused,
            _ => Status::InternalError,
        }
    }
}
