//! ## USBTMC
//!
//! USB Test & Measurement Class messages on top of a [`UsbTransfer`].
//!
//! Every message is wrapped in the 12 byte header described by [`crate::UsbtmcHeader`].
//! The bTag is shared by a request and its response. It only moves on once a
//! response has been read and validated, so a failed read can be retried with
//! the same tag (after a `clear_buffer` if the device got out of sync).
//!

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use super::{preview, InboundBuffer, Interface, InterfaceKind, UsbConfig, UsbInterface, UsbTransfer};
use crate::communication::bulk::{check_header, frame_message, UsbtmcHeader};
use crate::communication::control;
use crate::constants::misc::{DEFAULT_BUFFER_SIZE, DEFAULT_TERM_CHAR, USBTMC_HEADER_SIZE};
use crate::constants::usb::{USBTMC_CLASS_CODE, USBTMC_SUBCLASS_CODE};
use crate::constants::{bulk_msg_id, transfer_attr};
use crate::error::Error;
use crate::types::{BTag, Capabilities, CtlBTag};

/// ### USBTMC Interface
///
/// Message based channel to a USBTMC instrument.
///
pub struct UsbtmcInterface<T: UsbTransfer = UsbInterface> {
    usb: T,
    btag: BTag,
    ctl_btag: CtlBTag,
    capabilities: Option<Capabilities>,
    /// EOM flag of the last transfer read
    last_eom: bool,
    /// Transfers of a message whose EOM has not arrived yet
    partial: Vec<u8>,
    /// Message bytes that did not fit the caller's buffer
    spill: Vec<u8>,
    inbound: InboundBuffer,
}

impl UsbtmcInterface<UsbInterface> {
    /// ### Open
    ///
    /// Open a USBTMC device, read its capabilities and clear its buffers.
    ///
    pub fn open(config: UsbConfig) -> Result<UsbtmcInterface<UsbInterface>> {
        let usb = UsbInterface::open(config)?;

        if !is_usbtmc(&usb) {
            return Err(Error::DeviceIncompatible.into());
        }

        let mut interface = UsbtmcInterface::from_transfer(usb);
        interface.initialize()?;
        Ok(interface)
    }
}

impl<T: UsbTransfer> UsbtmcInterface<T> {
    /// Wrap an already opened transfer, no request is sent
    pub fn from_transfer(usb: T) -> Self {
        Self {
            usb,
            btag: BTag::new(),
            ctl_btag: CtlBTag::new(),
            capabilities: None,
            last_eom: true,
            partial: Vec::new(),
            spill: Vec::new(),
            inbound: InboundBuffer::new(),
        }
    }

    fn initialize(&mut self) -> Result<()> {
        let capabilities = self.capabilities()?;
        debug!(?capabilities, "usbtmc capabilities");
        self.clear_buffer()
    }

    /// The wrapped transfer
    pub fn transfer(&self) -> &T {
        &self.usb
    }

    pub fn transfer_mut(&mut self) -> &mut T {
        &mut self.usb
    }

    /// Tag used by the next request
    pub fn btag(&self) -> u8 {
        self.btag.current()
    }

    /// True if the last transfer read ended the message
    pub fn last_eom(&self) -> bool {
        self.last_eom
    }

    /// ### Capabilities
    ///
    /// Device capabilities, queried once with GET_CAPABILITIES.
    ///
    pub fn capabilities(&mut self) -> Result<Capabilities> {
        if let Some(capabilities) = &self.capabilities {
            return Ok(capabilities.clone());
        }
        let timeout = self.usb.timeout();
        let capabilities = control::get_capabilities(&mut self.usb, timeout)?;
        self.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    /// ### Write Dev Dep Msg
    ///
    /// Send `payload` as one DEV_DEP_MSG_OUT transfer.
    ///
    /// #### Returns
    /// The number of bytes put on the wire, header and alignment included.
    ///
    pub fn write_dev_dep_msg(&mut self, payload: &[u8], attributes: u8) -> Result<usize> {
        let header = UsbtmcHeader::dev_dep_msg_out(self.btag.current(), payload.len() as u32, attributes);
        let frame = frame_message(&header, payload);
        let timeout = self.usb.timeout();
        self.usb.write_bulk(&frame, timeout)?;
        debug!(btag = header.btag, bytes = payload.len(), message = %preview(payload), "dev dep msg out");
        Ok(frame.len())
    }

    /// ### Read Dev Dep Msg
    ///
    /// Request one DEV_DEP_MSG_IN transfer and return its payload.
    ///
    /// The TERM_CHAR attribute is dropped if the device reported that it cannot
    /// stop on a terminating character. An empty bulk read is an empty response.
    ///
    pub fn read_dev_dep_msg(
        &mut self,
        timeout: Duration,
        attributes: u8,
        term_char: u8,
    ) -> Result<Vec<u8>> {
        let mut attributes = attributes;
        if let Some(capabilities) = &self.capabilities {
            if !capabilities.supports_bulk_in_term_char {
                attributes &= !transfer_attr::TERM_CHAR;
            }
        }
        let request = UsbtmcHeader::request_dev_dep_msg_in(
            self.btag.current(),
            (DEFAULT_BUFFER_SIZE - USBTMC_HEADER_SIZE) as u32,
            attributes,
            term_char,
        );
        self.read_message(request, bulk_msg_id::DEV_DEP_MSG_IN, timeout)
    }

    /// Send `payload` as one VENDOR_SPECIFIC_OUT transfer
    pub fn write_vendor_specific(&mut self, payload: &[u8]) -> Result<usize> {
        let header = UsbtmcHeader::vendor_specific_out(self.btag.current(), payload.len() as u32);
        let frame = frame_message(&header, payload);
        let timeout = self.usb.timeout();
        self.usb.write_bulk(&frame, timeout)?;
        debug!(btag = header.btag, bytes = payload.len(), "vendor specific out");
        Ok(frame.len())
    }

    /// Request one VENDOR_SPECIFIC_IN transfer and return its payload
    pub fn read_vendor_specific(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let request = UsbtmcHeader::request_vendor_specific_in(
            self.btag.current(),
            (DEFAULT_BUFFER_SIZE - USBTMC_HEADER_SIZE) as u32,
        );
        self.read_message(request, bulk_msg_id::VENDOR_SPECIFIC_IN, timeout)
    }

    fn read_message(
        &mut self,
        request: UsbtmcHeader,
        expected_msg_id: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let btag = request.btag;
        self.usb.write_bulk(&request.to_bytes(), timeout)?;

        // READING LOOP
        // ==========

        let mut buffer = vec![0x00; DEFAULT_BUFFER_SIZE];
        let n = self.usb.read_bulk(&mut buffer, timeout)?;
        if n == 0 {
            debug!(btag, "empty response");
            self.last_eom = true;
            return Ok(Vec::new());
        }

        let header = check_header(&buffer[..n], expected_msg_id, btag)?;
        let transfer_size = header.transfer_size as usize;
        let mut payload = buffer[USBTMC_HEADER_SIZE..n].to_vec();

        while payload.len() < transfer_size {
            let n = self.usb.read_bulk(&mut buffer, timeout)?;
            if n == 0 {
                return Err(Error::Protocol(format!(
                    "transfer ended after {} of {} bytes",
                    payload.len(),
                    transfer_size
                ))
                .into());
            }
            payload.extend_from_slice(&buffer[..n]);
        }
        // alignment bytes
        payload.truncate(transfer_size);

        self.last_eom = header.eom();
        self.btag.advance();
        debug!(btag, bytes = payload.len(), eom = self.last_eom, message = %preview(&payload), "message in");
        Ok(payload)
    }

    /// ### Clear Buffer
    ///
    /// INITIATE_CLEAR the device queues and drop everything buffered locally.
    ///
    pub fn clear_buffer(&mut self) -> Result<()> {
        let timeout = self.usb.timeout();
        control::clear_buffers(&mut self.usb, timeout)?;
        self.partial.clear();
        self.spill.clear();
        self.inbound.clear();
        self.last_eom = true;
        Ok(())
    }

    /// Abort the Bulk-OUT transfer of the current tag
    pub fn abort_bulk_out(&mut self) -> Result<usize> {
        let timeout = self.usb.timeout();
        control::abort_bulk_out(&mut self.usb, self.btag.current(), timeout)
    }

    /// Abort the Bulk-IN transfer of the current tag, dropping any partial message
    pub fn abort_bulk_in(&mut self) -> Result<usize> {
        let timeout = self.usb.timeout();
        let sent = control::abort_bulk_in(&mut self.usb, self.btag.current(), timeout)?;
        self.partial.clear();
        self.spill.clear();
        self.last_eom = true;
        Ok(sent)
    }

    /// Blink the activity indicator of the device
    pub fn indicator_pulse(&mut self) -> Result<()> {
        if !self.capabilities()?.accepts_indicator_pulse_request {
            return Err(Error::Configuration("device does not accept INDICATOR_PULSE".into()).into());
        }
        let timeout = self.usb.timeout();
        control::indicator_pulse(&mut self.usb, timeout)
    }

    /// ### Read Status Byte
    ///
    /// USB488 status byte, read through the control endpoint.
    ///
    pub fn read_status_byte(&mut self) -> Result<u8> {
        let timeout = self.usb.timeout();
        let tag = self.ctl_btag.next();
        control::read_status_byte(&mut self.usb, tag, timeout)
    }
}

impl<T: UsbTransfer> Interface for UsbtmcInterface<T> {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Usbtmc
    }

    fn open(&mut self) -> Result<()> {
        if self.usb.good() {
            return Ok(());
        }
        self.usb.open()?;
        self.btag = BTag::new();
        self.capabilities = None;
        self.initialize()
    }

    fn close(&mut self) -> Result<()> {
        self.partial.clear();
        self.spill.clear();
        self.inbound.clear();
        self.usb.close()
    }

    fn good(&self) -> bool {
        self.usb.good()
    }

    fn info(&self) -> String {
        let info = self.usb.info();
        match info.strip_prefix("usb;") {
            Some(rest) => format!("usbtmc;{rest}"),
            None => format!("usbtmc;{info}"),
        }
    }

    fn timeout(&self) -> Duration {
        self.usb.timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.usb.set_timeout(timeout)
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        self.write_dev_dep_msg(data, transfer_attr::EOM)?;
        Ok(data.len())
    }

    /// ### Read Raw
    ///
    /// Read a complete message, following transfers until EOM. Bytes that do not
    /// fit into `buf` are handed out by the next call. Transfers read before a
    /// failure are kept, and the next call continues the same message.
    ///
    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.spill.is_empty() {
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let part = self.read_dev_dep_msg(remaining, transfer_attr::TERM_CHAR, DEFAULT_TERM_CHAR)?;
                self.partial.extend_from_slice(&part);
                if self.last_eom {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(bytes = self.partial.len(), "message incomplete at deadline");
                    return Err(Error::Timeout("message did not end before the deadline".into()).into());
                }
            }
            self.spill = std::mem::take(&mut self.partial);
        }

        let n = buf.len().min(self.spill.len());
        buf[..n].copy_from_slice(&self.spill[..n]);
        self.spill.drain(..n);
        Ok(n)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }
}

/// True if the claimed interface of `usb` is a USBTMC interface
fn is_usbtmc(usb: &UsbInterface) -> bool {
    usb.mode().map_or(false, |mode| {
        mode.class_code == USBTMC_CLASS_CODE && mode.sub_class_code == USBTMC_SUBCLASS_CODE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::usbtmc_status;
    use crate::error::{ErrorExt, ErrorKind};
    use crate::interface::MockUsbTransfer;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn tmc() -> (UsbtmcInterface<MockUsbTransfer>, MockUsbTransfer) {
        let usb = MockUsbTransfer::new();
        (UsbtmcInterface::from_transfer(usb.clone()), usb)
    }

    fn capabilities_reply(term_char: bool) -> [u8; 0x18] {
        let mut reply = [0u8; 0x18];
        reply[0] = usbtmc_status::STATUS_SUCCESS;
        reply[5] = term_char as u8;
        reply
    }

    #[test]
    fn test_write_frames_payload() {
        let (mut tmc, usb) = tmc();
        for len in [0usize, 1, 3, 4, 5, 100] {
            let payload = vec![b'x'; len];
            let written = tmc.write_dev_dep_msg(&payload, transfer_attr::EOM).unwrap();
            assert_eq!(written, (12 + len + 3) / 4 * 4);

            let frame = usb.bulk_out().pop().unwrap();
            assert_eq!(frame.len(), written);
            let header = UsbtmcHeader::parse(&frame).unwrap();
            assert_eq!(header.msg_id, bulk_msg_id::DEV_DEP_MSG_OUT);
            assert_eq!(header.transfer_size as usize, len);
            assert!(header.eom());
        }
        // writes keep the tag
        assert_eq!(tmc.btag(), 1);
    }

    #[test]
    fn test_tag_advances_per_response() {
        let (mut tmc, usb) = tmc();
        for k in 0..300u32 {
            let tag = (1 + k) as u8;
            assert_eq!(tmc.btag(), tag);
            usb.queue_dev_dep_msg(tag, b"1\n", true);
            assert_eq!(tmc.read_dev_dep_msg(TIMEOUT, 0, b'\n').unwrap(), b"1\n");

            let request = usb.bulk_out().pop().unwrap();
            assert_eq!(request[0], bulk_msg_id::REQUEST_DEV_DEP_MSG_IN);
            assert_eq!(request[1], tag);
            assert_eq!(request[2], !tag);
        }
        assert_eq!(tmc.btag(), ((1 + 300u32) % 256) as u8);
    }

    #[test]
    fn test_tag_mismatch_is_protocol_error() {
        let (mut tmc, usb) = tmc();
        usb.queue_dev_dep_msg(5, b"stale", true);

        let err = tmc.read_dev_dep_msg(TIMEOUT, 0, b'\n').unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
        assert_eq!(tmc.btag(), 1);

        // the retry uses the same tag
        usb.queue_dev_dep_msg(1, b"fresh", true);
        assert_eq!(tmc.read_dev_dep_msg(TIMEOUT, 0, b'\n').unwrap(), b"fresh");
        assert_eq!(tmc.btag(), 2);
    }

    #[test]
    fn test_wrong_msg_id_is_protocol_error() {
        let (mut tmc, usb) = tmc();
        let header = UsbtmcHeader::vendor_specific_out(1, 2);
        usb.queue_bulk_in(&frame_message(&header, b"ok"));
        let err = tmc.read_dev_dep_msg(TIMEOUT, 0, b'\n').unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
        assert_eq!(tmc.btag(), 1);
    }

    #[test]
    fn test_chunked_reassembly() {
        let (mut tmc, usb) = tmc();
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let header = UsbtmcHeader {
            msg_id: bulk_msg_id::DEV_DEP_MSG_IN,
            btag: 1,
            transfer_size: payload.len() as u32,
            attributes: transfer_attr::EOM,
            term_char: 0,
        };
        let frame = frame_message(&header, &payload);
        for chunk in frame.chunks(512) {
            usb.queue_bulk_in(chunk);
        }

        let data = tmc.read_dev_dep_msg(TIMEOUT, 0, b'\n').unwrap();
        assert_eq!(data, payload);
        assert_eq!(tmc.btag(), 2);
    }

    #[test]
    fn test_short_continuation_is_protocol_error() {
        let (mut tmc, usb) = tmc();
        let header = UsbtmcHeader {
            msg_id: bulk_msg_id::DEV_DEP_MSG_IN,
            btag: 1,
            transfer_size: 100,
            attributes: transfer_attr::EOM,
            term_char: 0,
        };
        usb.queue_bulk_in(&frame_message(&header, &[0u8; 20])[..32]);
        usb.queue_bulk_in(&[]);

        let err = tmc.read_dev_dep_msg(TIMEOUT, 0, b'\n').unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
        assert_eq!(tmc.btag(), 1);
    }

    #[test]
    fn test_empty_response() {
        let (mut tmc, usb) = tmc();
        usb.queue_bulk_in(&[]);
        assert!(tmc.read_dev_dep_msg(TIMEOUT, 0, b'\n').unwrap().is_empty());
        assert_eq!(tmc.btag(), 1);
    }

    #[test]
    fn test_term_char_follows_capabilities() {
        let (mut tmc, usb) = tmc();
        usb.queue_control_in(&capabilities_reply(false));
        tmc.capabilities().unwrap();

        usb.queue_dev_dep_msg(1, b"1\n", true);
        tmc.read_dev_dep_msg(TIMEOUT, transfer_attr::TERM_CHAR, b'\n').unwrap();
        let request = usb.bulk_out().pop().unwrap();
        assert_eq!(request[8..10], [0x00, 0x00]);

        let (mut tmc, usb) = self::tmc();
        usb.queue_control_in(&capabilities_reply(true));
        tmc.capabilities().unwrap();
        // cached after the first query
        tmc.capabilities().unwrap();
        assert_eq!(usb.control_requests().len(), 1);

        usb.queue_dev_dep_msg(1, b"1\n", true);
        tmc.read_dev_dep_msg(TIMEOUT, transfer_attr::TERM_CHAR, b'\n').unwrap();
        let request = usb.bulk_out().pop().unwrap();
        assert_eq!(request[8..10], [transfer_attr::TERM_CHAR, b'\n']);
    }

    #[test]
    fn test_query_follows_transfers_until_eom() {
        let (mut tmc, usb) = tmc();
        usb.queue_dev_dep_msg(1, b"ACME,PSU-100,", false);
        usb.queue_dev_dep_msg(2, b"SN123,1.0\n", true);

        let reply = tmc.query("*IDN?\n", TIMEOUT).unwrap();
        assert_eq!(reply, "ACME,PSU-100,SN123,1.0\n");
        assert_eq!(tmc.btag(), 3);

        let frames = usb.bulk_out();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][12..18], b"*IDN?\n");
    }

    #[test]
    fn test_read_resumes_after_timeout_mid_message() {
        let (mut tmc, usb) = tmc();
        usb.queue_dev_dep_msg(1, b"ACME,PSU-100,", false);

        let err = tmc.read(TIMEOUT).unwrap_err();
        assert!(err.is_timeout());
        assert!(!tmc.last_eom());
        // first transfer consumed its tag
        assert_eq!(tmc.btag(), 2);

        usb.queue_dev_dep_msg(2, b"SN123,1.0\n", true);
        assert_eq!(tmc.read(TIMEOUT).unwrap(), "ACME,PSU-100,SN123,1.0\n");
        assert_eq!(tmc.btag(), 3);
    }

    #[test]
    fn test_clear_buffer_drops_partial_message() {
        let (mut tmc, usb) = tmc();
        usb.queue_dev_dep_msg(1, b"stale,", false);
        assert!(tmc.read(TIMEOUT).unwrap_err().is_timeout());

        usb.queue_control_in(&[usbtmc_status::STATUS_SUCCESS]);
        usb.queue_control_in(&[usbtmc_status::STATUS_SUCCESS, 0]);
        tmc.clear_buffer().unwrap();

        usb.queue_dev_dep_msg(2, b"fresh\n", true);
        assert_eq!(tmc.read(TIMEOUT).unwrap(), "fresh\n");
    }

    #[test]
    fn test_read_raw_keeps_surplus() {
        let (mut tmc, usb) = tmc();
        usb.queue_dev_dep_msg(1, b"1.25,2.50\n", true);

        let mut buf = [0u8; 4];
        assert_eq!(tmc.read_raw(&mut buf, TIMEOUT).unwrap(), 4);
        assert_eq!(&buf, b"1.25");
        assert_eq!(tmc.read_until("\n", TIMEOUT).unwrap(), ",2.50");
        assert_eq!(usb.bulk_out().len(), 1);
    }

    #[test]
    fn test_vendor_specific() {
        let (mut tmc, usb) = tmc();
        let written = tmc.write_vendor_specific(&[0xDE, 0xAD]).unwrap();
        assert_eq!(written, 16);
        assert_eq!(usb.bulk_out()[0][0], bulk_msg_id::VENDOR_SPECIFIC_OUT);

        let header = UsbtmcHeader {
            msg_id: bulk_msg_id::VENDOR_SPECIFIC_IN,
            btag: 1,
            transfer_size: 2,
            attributes: 0,
            term_char: 0,
        };
        usb.queue_bulk_in(&frame_message(&header, &[0xBE, 0xEF]));
        assert_eq!(tmc.read_vendor_specific(TIMEOUT).unwrap(), vec![0xBE, 0xEF]);
        assert_eq!(usb.bulk_out()[1][0], bulk_msg_id::REQUEST_VENDOR_SPECIFIC_IN);
    }

    #[test]
    fn test_indicator_pulse_requires_capability() {
        let (mut tmc, usb) = tmc();
        usb.queue_control_in(&capabilities_reply(false));
        let err = tmc.indicator_pulse().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Configuration));
    }

    #[test]
    fn test_clear_buffer_resets_local_state() {
        let (mut tmc, usb) = tmc();
        usb.queue_dev_dep_msg(1, b"leftover", true);
        let mut buf = [0u8; 2];
        tmc.read_raw(&mut buf, TIMEOUT).unwrap();

        usb.queue_control_in(&[usbtmc_status::STATUS_SUCCESS]);
        usb.queue_control_in(&[usbtmc_status::STATUS_SUCCESS, 0]);
        tmc.clear_buffer().unwrap();

        assert!(tmc.read_raw(&mut buf, TIMEOUT).unwrap_err().is_timeout());
        assert_eq!(usb.halts_cleared(), 1);
    }

    #[test]
    fn test_info_and_close() {
        let (mut tmc, _usb) = tmc();
        assert_eq!(tmc.info(), "usbtmc;mock");
        assert_eq!(tmc.kind(), InterfaceKind::Usbtmc);
        tmc.close().unwrap();
        assert!(!tmc.good());
        assert_eq!(
            tmc.write("*RST\n").unwrap_err().kind(),
            Some(ErrorKind::Connection)
        );
    }
}
