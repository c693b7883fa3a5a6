//! Minimal per-stream wrapper consumed by the fixture's stream factory and
//! the peer-stream event path.

use std::sync::{Arc, Mutex};

use crate::api::{
    ConnectionDriver, ConnectionHandle, StreamHandle, STREAM_OPEN_FLAG_UNIDIRECTIONAL,
};
use crate::error::Status;
use crate::test_failure;

/// Invoked once when the wrapped stream goes away.
pub type StreamShutdownHandler = Box<dyn Fn(&TestStream) + Send + Sync>;

/// Owns exactly one stream handle from creation (or adoption) to drop.
pub struct TestStream {
    driver: Arc<dyn ConnectionDriver>,
    stream: StreamHandle,
    open_flags: u32,
    shutdown_handler: Mutex<Option<StreamShutdownHandler>>,
}

impl TestStream {
    /// Open a local stream on `conn`. Ownership of the new handle stays
    /// with the returned wrapper.
    pub fn from_connection_handle(
        driver: Arc<dyn ConnectionDriver>,
        conn: ConnectionHandle,
        shutdown_handler: Option<StreamShutdownHandler>,
        flags: u32,
    ) -> Result<TestStream, Status> {
        let stream = match driver.stream_open(conn, flags) {
            Ok(stream) => stream,
            Err(status) => {
                test_failure!("stream_open failed, {}", status);
                return Err(status);
            }
        };
        Ok(Self {
            driver,
            stream,
            open_flags: flags,
            shutdown_handler: Mutex::new(shutdown_handler),
        })
    }

    /// Adopt a peer-started stream handle delivered by the dispatcher. The
    /// wrapper takes ownership of the handle.
    pub fn from_peer_handle(
        driver: Arc<dyn ConnectionDriver>,
        stream: StreamHandle,
        flags: u32,
        shutdown_handler: Option<StreamShutdownHandler>,
    ) -> TestStream {
        Self {
            driver,
            stream,
            open_flags: flags,
            shutdown_handler: Mutex::new(shutdown_handler),
        }
    }

    pub fn handle(&self) -> StreamHandle {
        self.stream
    }

    pub fn is_unidirectional(&self) -> bool {
        self.open_flags & STREAM_OPEN_FLAG_UNIDIRECTIONAL != 0
    }
}

impl Drop for TestStream {
    fn drop(&mut self) {
        let handler = self.shutdown_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler(self);
        }
        self.driver.stream_close(self.stream);
    }
}
