//! ## Mock
//!
//! In-memory interfaces for testing drivers and protocol layers without hardware.
//!
//! Both mocks are cheap to clone. Clones share the queued responses and the
//! captured writes, so a test can keep one clone for inspection while the code
//! under test owns another.
//!

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tracing::trace;

use super::{InboundBuffer, Interface, InterfaceKind, UsbTransfer};
use crate::communication::bulk::{frame_message, UsbtmcHeader};
use crate::constants::bulk_msg_id;
use crate::constants::misc::DEFAULT_TIMEOUT_DURATION;
use crate::error::Error;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct MockState {
    /// Chunks handed out by successive reads
    responses: VecDeque<Vec<u8>>,
    /// Canned replies queued whenever the matching command is written
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    /// Captured writes
    writes: Vec<Vec<u8>>,
    connected: bool,
}

/// ### Mock Interface
///
/// Scripted byte channel. Every queued response is returned by exactly one raw
/// read, larger responses are split across reads if the caller's buffer is small.
/// A read with nothing queued fails with a timeout right away.
///
#[derive(Debug, Clone)]
pub struct MockInterface {
    state: Arc<Mutex<MockState>>,
    timeout: Duration,
    inbound: InboundBuffer,
}

impl MockInterface {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                ..MockState::default()
            })),
            timeout: DEFAULT_TIMEOUT_DURATION,
            inbound: InboundBuffer::new(),
        }
    }

    /// Queue raw bytes for the next read
    pub fn queue_response(&self, data: &[u8]) {
        lock(&self.state).responses.push_back(data.to_vec());
    }

    pub fn queue_str(&self, text: &str) {
        self.queue_response(text.as_bytes());
    }

    /// ### Respond To
    ///
    /// Queue `response` every time exactly `command` is written.
    ///
    pub fn respond_to(&self, command: &str, response: &str) {
        lock(&self.state)
            .replies
            .push((command.as_bytes().to_vec(), response.as_bytes().to_vec()));
    }

    /// All writes captured so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Captured writes decoded as text
    pub fn written_strings(&self) -> Vec<String> {
        lock(&self.state)
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// Number of queued responses not read yet
    pub fn pending_responses(&self) -> usize {
        lock(&self.state).responses.len()
    }

    /// Simulate the device going away
    pub fn disconnect(&self) {
        lock(&self.state).connected = false;
    }

    pub fn reconnect(&self) {
        lock(&self.state).connected = true;
    }
}

impl Default for MockInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface for MockInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Mock
    }

    fn open(&mut self) -> Result<()> {
        self.reconnect();
        self.inbound.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.disconnect();
        Ok(())
    }

    fn good(&self) -> bool {
        lock(&self.state).connected
    }

    fn info(&self) -> String {
        "mock".to_string()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::not_connected("mock").into());
        }
        state.writes.push(data.to_vec());

        let replies: Vec<Vec<u8>> = state
            .replies
            .iter()
            .filter(|(command, _)| command.as_slice() == data)
            .map(|(_, reply)| reply.clone())
            .collect();
        state.responses.extend(replies);
        Ok(data.len())
    }

    fn read_raw(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(Error::not_connected("mock").into());
        }
        let mut chunk = state
            .responses
            .pop_front()
            .ok_or_else(|| Error::Timeout("no response queued".to_string()))?;

        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            state.responses.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        trace!(bytes = chunk.len(), "mock read");
        Ok(chunk.len())
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }
}

/// A control transfer issued against [`MockUsbTransfer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

#[derive(Debug, Default)]
struct MockUsbState {
    bulk_in: VecDeque<Vec<u8>>,
    bulk_out: Vec<Vec<u8>>,
    control_in: VecDeque<Vec<u8>>,
    control_requests: Vec<ControlRequest>,
    halts_cleared: usize,
    connected: bool,
}

/// ### Mock USB Transfer
///
/// Scripted bulk and control endpoints for exercising the USBTMC layer.
///
#[derive(Debug, Clone)]
pub struct MockUsbTransfer {
    state: Arc<Mutex<MockUsbState>>,
    timeout: Duration,
    inbound: InboundBuffer,
}

impl MockUsbTransfer {
    /// Interface number reported to control requests
    pub const INTERFACE_NUMBER: u8 = 0;
    pub const BULK_OUT_ADDRESS: u8 = 0x01;
    pub const BULK_IN_ADDRESS: u8 = 0x82;
    pub const MAX_PACKET_SIZE: usize = 512;

    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockUsbState {
                connected: true,
                ..MockUsbState::default()
            })),
            timeout: DEFAULT_TIMEOUT_DURATION,
            inbound: InboundBuffer::new(),
        }
    }

    /// Queue one raw bulk IN transfer
    pub fn queue_bulk_in(&self, data: &[u8]) {
        lock(&self.state).bulk_in.push_back(data.to_vec());
    }

    /// ### Queue Dev Dep Msg
    ///
    /// Queue a complete DEV_DEP_MSG_IN transfer answering the request tagged `btag`.
    ///
    pub fn queue_dev_dep_msg(&self, btag: u8, payload: &[u8], eom: bool) {
        let header = UsbtmcHeader {
            msg_id: bulk_msg_id::DEV_DEP_MSG_IN,
            btag,
            transfer_size: payload.len() as u32,
            attributes: eom as u8,
            term_char: 0,
        };
        self.queue_bulk_in(&frame_message(&header, payload));
    }

    /// Queue the data stage of the next IN control transfer
    pub fn queue_control_in(&self, data: &[u8]) {
        lock(&self.state).control_in.push_back(data.to_vec());
    }

    /// Bulk OUT transfers captured so far
    pub fn bulk_out(&self) -> Vec<Vec<u8>> {
        lock(&self.state).bulk_out.clone()
    }

    pub fn control_requests(&self) -> Vec<ControlRequest> {
        lock(&self.state).control_requests.clone()
    }

    /// Number of `clear_halts` calls
    pub fn halts_cleared(&self) -> usize {
        lock(&self.state).halts_cleared
    }

    pub fn disconnect(&self) {
        lock(&self.state).connected = false;
    }

    fn check_connected(state: &MockUsbState) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(Error::not_connected("usb;mock").into())
        }
    }
}

impl Default for MockUsbTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface for MockUsbTransfer {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Mock
    }

    fn open(&mut self) -> Result<()> {
        lock(&self.state).connected = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.disconnect();
        Ok(())
    }

    fn good(&self) -> bool {
        lock(&self.state).connected
    }

    fn info(&self) -> String {
        "usb;mock".to_string()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        let timeout = self.timeout;
        self.write_bulk(data, timeout)
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_bulk(buf, timeout)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }
}

impl UsbTransfer for MockUsbTransfer {
    fn interface_number(&self) -> u8 {
        Self::INTERFACE_NUMBER
    }

    fn bulk_out_address(&self) -> u8 {
        Self::BULK_OUT_ADDRESS
    }

    fn bulk_in_address(&self) -> u8 {
        Self::BULK_IN_ADDRESS
    }

    fn max_packet_size(&self) -> usize {
        Self::MAX_PACKET_SIZE
    }

    fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        let mut state = lock(&self.state);
        Self::check_connected(&state)?;
        state.bulk_out.push(data.to_vec());
        Ok(data.len())
    }

    fn read_bulk(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = lock(&self.state);
        Self::check_connected(&state)?;
        let packet = state
            .bulk_in
            .pop_front()
            .ok_or_else(|| Error::Timeout("no bulk in transfer queued".to_string()))?;
        if packet.len() > buf.len() {
            return Err(Error::Io {
                message: format!("bulk in overflow ({} > {})", packet.len(), buf.len()),
                code: None,
            }
            .into());
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = lock(&self.state);
        Self::check_connected(&state)?;
        state.control_requests.push(ControlRequest {
            request_type,
            request,
            value,
            index,
        });
        let data = state
            .control_in
            .pop_front()
            .ok_or_else(|| Error::Timeout("no control response queued".to_string()))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = lock(&self.state);
        Self::check_connected(&state)?;
        state.control_requests.push(ControlRequest {
            request_type,
            request,
            value,
            index,
        });
        Ok(data.len())
    }

    fn clear_halts(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check_connected(&state)?;
        state.halts_cleared += 1;
        Ok(())
    }
}
