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

//! # Simulated Driver
//!
//! In-memory [`ConnectionDriver`] used by the harness's own tests. Each
//! connection carries a parameter table pre-seeded with plausible values,
//! queues of scripted statuses for failure injection, and call counters.
//! Events can be dispatched inline on the calling thread or posted to a
//! dedicated event thread, so fixtures are exercised across the same
//! thread boundary a production driver would use.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use log::debug;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{
    AddressFamily, ConnectionDriver, ConnectionEvent, ConnectionEventHandler, ConnectionHandle,
    RegistrationHandle, StreamHandle,
};
use crate::error::Status;
use crate::params::{self, ConnectionStatistics, ParamKey, StreamSchedulingScheme};

struct SimConnection {
    handler: Option<Weak<dyn ConnectionEventHandler>>,
    params: HashMap<ParamKey, Vec<u8>>,
    set_scripts: HashMap<ParamKey, VecDeque<Status>>,
    get_scripts: HashMap<ParamKey, VecDeque<Status>>,
    set_calls: HashMap<ParamKey, u32>,
    started: bool,
    start_script: Option<Status>,
    shutdown_calls: Vec<(u32, u64)>,
    close_count: u32,
    resumption_len: usize,
    cid: [u8; 8],
}

impl SimConnection {
    fn new() -> Self {
        let mut cid = [0u8; 8];
        rand::thread_rng().fill(&mut cid[..]);
        Self {
            handler: None,
            params: default_params(),
            set_scripts: HashMap::new(),
            get_scripts: HashMap::new(),
            set_calls: HashMap::new(),
            started: false,
            start_script: None,
            shutdown_calls: Vec::new(),
            close_count: 0,
            resumption_len: 0,
            cid,
        }
    }
}

fn seed<T: Serialize>(table: &mut HashMap<ParamKey, Vec<u8>>, key: ParamKey, value: &T) {
    let bytes = params::encode(value).expect("sim param encoding");
    table.insert(key, bytes);
}

/// Values a freshly opened connection reports before any test touches it.
fn default_params() -> HashMap<ParamKey, Vec<u8>> {
    let mut table = HashMap::new();
    seed(&mut table, ParamKey::QuicVersion, &0x0000_0001u32);
    seed(
        &mut table,
        ParamKey::LocalAddress,
        &SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
    );
    seed(
        &mut table,
        ParamKey::RemoteAddress,
        &SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
    );
    seed(&mut table, ParamKey::IdleTimeout, &30_000u64);
    seed(&mut table, ParamKey::DisconnectTimeout, &16_000u32);
    seed(&mut table, ParamKey::PeerBidiStreamCount, &0u16);
    seed(&mut table, ParamKey::PeerUnidiStreamCount, &0u16);
    seed(&mut table, ParamKey::LocalBidiStreamCount, &100u16);
    seed(&mut table, ParamKey::LocalUnidiStreamCount, &3u16);
    seed(
        &mut table,
        ParamKey::Statistics,
        &ConnectionStatistics::default(),
    );
    seed(&mut table, ParamKey::CertValidationFlags, &0u32);
    seed(&mut table, ParamKey::KeepAlive, &0u32);
    seed(&mut table, ParamKey::ShareUdpBinding, &false);
    seed(
        &mut table,
        ParamKey::StreamSchedulingScheme,
        &StreamSchedulingScheme::Fifo,
    );
    seed(&mut table, ParamKey::SendBuffering, &true);
    table
}

#[derive(Default)]
struct StreamState {
    close_count: u32,
}

#[derive(Default)]
struct SimState {
    connections: HashMap<u64, SimConnection>,
    streams: HashMap<u64, StreamState>,
    open_script: VecDeque<Status>,
}

pub struct SimDriver {
    state: Mutex<SimState>,
    next_handle: AtomicU64,
    events: Mutex<Sender<(ConnectionHandle, ConnectionEvent)>>,
}

impl SimDriver {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel();
        let driver = Arc::new(Self {
            state: Mutex::new(SimState::default()),
            next_handle: AtomicU64::new(1),
            events: Mutex::new(tx),
        });
        let weak = Arc::downgrade(&driver);
        thread::spawn(move || event_loop(weak, rx));
        driver
    }

    fn alloc(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// A fresh registration handle for client construction.
    pub fn registration(&self) -> RegistrationHandle {
        RegistrationHandle(self.alloc())
    }

    /// An already-accepted server-side connection handle.
    pub fn accept(&self) -> ConnectionHandle {
        let handle = self.alloc();
        self.state
            .lock()
            .unwrap()
            .connections
            .insert(handle, SimConnection::new());
        ConnectionHandle(handle)
    }

    /// A stream handle as the peer would have started it. The receiver of
    /// the matching event owns it.
    pub fn peer_stream(&self) -> StreamHandle {
        let handle = self.alloc();
        self.state
            .lock()
            .unwrap()
            .streams
            .insert(handle, StreamState::default());
        StreamHandle(handle)
    }

    /// Dispatch `event` inline on the calling thread.
    pub fn deliver(&self, conn: ConnectionHandle, event: ConnectionEvent) {
        self.dispatch(conn, event);
    }

    /// Enqueue `event` for the driver's event thread.
    pub fn post(&self, conn: ConnectionHandle, event: ConnectionEvent) {
        let _ = self.events.lock().unwrap().send((conn, event));
    }

    fn dispatch(&self, conn: ConnectionHandle, event: ConnectionEvent) {
        let handler = {
            let state = self.state.lock().unwrap();
            state
                .connections
                .get(&conn.0)
                .and_then(|entry| entry.handler.clone())
        };
        // Hold the strong reference for the whole callback; auto-delete
        // fixtures drop their own last reference from inside it.
        if let Some(handler) = handler.and_then(|weak| weak.upgrade()) {
            debug!("dispatching {:?} to connection {}", event, conn.0);
            let _ = handler.handle_event(event);
        }
    }

    //
    // Scripting and inspection
    //

    /// Queue statuses answered by the next `connection_open` calls.
    pub fn fail_connection_open(&self, status: Status) {
        self.state.lock().unwrap().open_script.push_back(status);
    }

    /// Script the status answered by `connection_start` on `conn`.
    pub fn fail_connection_start(&self, conn: ConnectionHandle, status: Status) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            entry.start_script = Some(status);
        }
    }

    /// Queue statuses answered by successive `set_param` calls for `key`
    /// before the table accepts the write.
    pub fn fail_set_param(&self, conn: ConnectionHandle, key: ParamKey, statuses: &[Status]) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            entry
                .set_scripts
                .entry(key)
                .or_default()
                .extend(statuses.iter().copied());
        }
    }

    /// Queue statuses answered by successive `get_param` calls for `key`.
    pub fn fail_get_param(&self, conn: ConnectionHandle, key: ParamKey, statuses: &[Status]) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            entry
                .get_scripts
                .entry(key)
                .or_default()
                .extend(statuses.iter().copied());
        }
    }

    /// Number of `set_param` calls observed for `key`.
    pub fn set_param_calls(&self, conn: ConnectionHandle, key: ParamKey) -> u32 {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(&conn.0)
            .and_then(|entry| entry.set_calls.get(&key).copied())
            .unwrap_or(0)
    }

    /// Make the zero-length resumption probe answer `BufferTooSmall`.
    pub fn set_resumption_available(&self, conn: ConnectionHandle, available: bool) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            entry.resumption_len = if available { 128 } else { 0 };
        }
    }

    /// Typed read of the stored parameter bytes.
    pub fn param<T: DeserializeOwned>(&self, conn: ConnectionHandle, key: ParamKey) -> Option<T> {
        let state = self.state.lock().unwrap();
        let bytes = state.connections.get(&conn.0)?.params.get(&key)?;
        params::decode(bytes).ok()
    }

    /// Typed write into the stored parameter bytes, bypassing scripts.
    pub fn seed_param<T: Serialize>(&self, conn: ConnectionHandle, key: ParamKey, value: &T) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            seed(&mut entry.params, key, value);
        }
    }

    pub fn started(&self, conn: ConnectionHandle) -> bool {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(&conn.0)
            .map(|entry| entry.started)
            .unwrap_or(false)
    }

    /// `(flags, error_code)` pairs recorded by `connection_shutdown`.
    pub fn shutdown_calls(&self, conn: ConnectionHandle) -> Vec<(u32, u64)> {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(&conn.0)
            .map(|entry| entry.shutdown_calls.clone())
            .unwrap_or_default()
    }

    pub fn close_count(&self, conn: ConnectionHandle) -> u32 {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(&conn.0)
            .map(|entry| entry.close_count)
            .unwrap_or(0)
    }

    pub fn stream_close_count(&self, stream: StreamHandle) -> u32 {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(&stream.0)
            .map(|entry| entry.close_count)
            .unwrap_or(0)
    }

    pub fn current_cid(&self, conn: ConnectionHandle) -> Option<[u8; 8]> {
        self.state
            .lock()
            .unwrap()
            .connections
            .get(&conn.0)
            .map(|entry| entry.cid)
    }
}

fn event_loop(driver: Weak<SimDriver>, rx: Receiver<(ConnectionHandle, ConnectionEvent)>) {
    while let Ok((conn, event)) = rx.recv() {
        match driver.upgrade() {
            Some(driver) => driver.dispatch(conn, event),
            None => break,
        }
    }
}

impl ConnectionDriver for SimDriver {
    fn connection_open(
        &self,
        _registration: RegistrationHandle,
    ) -> Result<ConnectionHandle, Status> {
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.open_script.pop_front() {
            if status.failed() {
                return Err(status);
            }
        }
        let handle = self.alloc();
        state.connections.insert(handle, SimConnection::new());
        Ok(ConnectionHandle(handle))
    }

    fn set_callback_handler(
        &self,
        conn: ConnectionHandle,
        handler: Weak<dyn ConnectionEventHandler>,
    ) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            entry.handler = Some(handler);
        }
    }

    fn connection_start(
        &self,
        conn: ConnectionHandle,
        _family: AddressFamily,
        _server_name: &str,
        _port: u16,
    ) -> Status {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.connections.get_mut(&conn.0) else {
            return Status::InvalidParameter;
        };
        if let Some(status) = entry.start_script.take() {
            if status.failed() {
                return status;
            }
        }
        entry.started = true;
        Status::Success
    }

    fn connection_shutdown(&self, conn: ConnectionHandle, flags: u32, error_code: u64) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            entry.shutdown_calls.push((flags, error_code));
        }
    }

    fn connection_close(&self, conn: ConnectionHandle) {
        if let Some(entry) = self.state.lock().unwrap().connections.get_mut(&conn.0) {
            entry.close_count += 1;
        }
    }

    fn set_param(&self, conn: ConnectionHandle, key: ParamKey, value: &[u8]) -> Status {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.connections.get_mut(&conn.0) else {
            return Status::InvalidParameter;
        };
        *entry.set_calls.entry(key).or_insert(0) += 1;
        if let Some(script) = entry.set_scripts.get_mut(&key) {
            if let Some(status) = script.pop_front() {
                if status.failed() {
                    return status;
                }
            }
        }
        match key {
            ParamKey::ForceKeyUpdate => {}
            ParamKey::ForceCidUpdate => {
                rand::thread_rng().fill(&mut entry.cid[..]);
            }
            ParamKey::LocalBidiStreamCount
            | ParamKey::LocalUnidiStreamCount
            | ParamKey::Statistics
            | ParamKey::ResumptionState => return Status::InvalidParameter,
            _ => {
                entry.params.insert(key, value.to_vec());
            }
        }
        Status::Success
    }

    fn get_param(
        &self,
        conn: ConnectionHandle,
        key: ParamKey,
        buf: &mut [u8],
        len: &mut usize,
    ) -> Status {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.connections.get_mut(&conn.0) else {
            return Status::InvalidParameter;
        };
        if let Some(script) = entry.get_scripts.get_mut(&key) {
            if let Some(status) = script.pop_front() {
                if status.failed() {
                    return status;
                }
            }
        }
        if key == ParamKey::ResumptionState {
            if entry.resumption_len == 0 {
                return Status::InvalidState;
            }
            if buf.len() < entry.resumption_len {
                *len = entry.resumption_len;
                return Status::BufferTooSmall;
            }
            buf[..entry.resumption_len].fill(0);
            *len = entry.resumption_len;
            return Status::Success;
        }
        let Some(bytes) = entry.params.get(&key) else {
            return Status::InvalidParameter;
        };
        if buf.len() < bytes.len() {
            *len = bytes.len();
            return Status::BufferTooSmall;
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        *len = bytes.len();
        Status::Success
    }

    fn stream_open(&self, conn: ConnectionHandle, _flags: u32) -> Result<StreamHandle, Status> {
        let mut state = self.state.lock().unwrap();
        if !state.connections.contains_key(&conn.0) {
            return Err(Status::InvalidParameter);
        }
        let handle = self.alloc();
        state.streams.insert(handle, StreamState::default());
        Ok(StreamHandle(handle))
    }

    fn stream_close(&self, stream: StreamHandle) {
        if let Some(entry) = self.state.lock().unwrap().streams.get_mut(&stream.0) {
            entry.close_count += 1;
        }
    }
}
