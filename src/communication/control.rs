//! ## Control
//!
//! Set of USBTMC and USB488 control requests to send to the device.
//!

use std::thread;
use std::time::{Duration, Instant};

use crate::constants::control_requests;
use crate::constants::misc::STATUS_POLL_INTERVAL;
use crate::constants::usbtmc_status;
use crate::error::{Error, ErrorExt};
use crate::interface::UsbTransfer;
use crate::types::Capabilities;

use anyhow::Result;
use rusb::{Direction, Recipient, RequestType};
use tracing::{debug, warn};

fn class_request_type(recipient: Recipient) -> u8 {
    rusb::request_type(Direction::In, RequestType::Class, recipient)
}

fn check_status(status: u8) -> Result<()> {
    match status {
        usbtmc_status::STATUS_SUCCESS => Ok(()),
        usbtmc_status::STATUS_FAILED => Err(Error::StatusFailure.into()),
        other => Err(Error::StatusUnexpectedFailure(other).into()),
    }
}

fn interface_request<T: UsbTransfer + ?Sized>(
    transfer: &mut T,
    request: u8,
    value: u16,
    buffer: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    let index = transfer.interface_number() as u16;
    let request_type = class_request_type(Recipient::Interface);
    let n = transfer.read_control(request_type, request, value, index, buffer, timeout)?;
    if n == 0 {
        return Err(Error::Protocol(format!("empty reply to control request {request}")).into());
    }
    Ok(())
}

/// Drain whatever the device still holds in its Bulk-IN FIFO
fn drain_bulk_in<T: UsbTransfer + ?Sized>(transfer: &mut T, timeout: Duration) -> Result<usize> {
    let packet_size = transfer.max_packet_size();
    let mut buffer = vec![0x00; packet_size];
    let mut drained = 0;
    loop {
        let n = match transfer.read_bulk(&mut buffer, timeout) {
            Ok(n) => n,
            Err(err) if err.is_timeout() => break,
            Err(err) => return Err(err),
        };
        drained += n;
        // a short packet ends the transfer
        if n < packet_size {
            break;
        }
    }
    debug!(bytes = drained, "drained bulk in fifo");
    Ok(drained)
}

/// ### Get Capabilities
///
/// GET_CAPABILITIES, decoded into [`Capabilities`].
///
pub fn get_capabilities<T: UsbTransfer + ?Sized>(
    transfer: &mut T,
    timeout: Duration,
) -> Result<Capabilities> {
    let mut buffer = [0x00; 0x18];
    interface_request(transfer, control_requests::GET_CAPABILITIES, 0, &mut buffer, timeout)?;
    check_status(buffer[0])?;

    let interface_capabilities = buffer[4];
    let device_capabilities = buffer[5];

    Ok(Capabilities {
        bcd_version: u16::from_le_bytes([buffer[2], buffer[3]]),
        accepts_indicator_pulse_request: interface_capabilities & 0b0000_0100 != 0,
        is_talk_only: interface_capabilities & 0b0000_0010 != 0,
        is_listen_only: interface_capabilities & 0b0000_0001 != 0,
        supports_bulk_in_term_char: device_capabilities & 0b0000_0001 != 0,
    })
}

/// ### Clear Buffers
///
/// Clear all input and output buffers associated to the device.
///
/// Sends INITIATE_CLEAR and polls CHECK_CLEAR_STATUS until the device is done,
/// draining the Bulk-IN FIFO whenever it reports unread data. The halts on both
/// bulk endpoints are cleared afterwards.
///
/// **WARNING: must abort all BULK transfers and prevent new ones before using this command.**
///
pub fn clear_buffers<T: UsbTransfer + ?Sized>(transfer: &mut T, timeout: Duration) -> Result<()> {
    // INITIATE CLEAR
    // ==========

    let mut buffer = [0x00; 1];
    interface_request(transfer, control_requests::INITIATE_CLEAR, 0, &mut buffer, timeout)?;
    check_status(buffer[0])?;

    // CHECK CLEAR
    // ==========

    let deadline = Instant::now() + timeout;
    let mut buffer = [0x00; 2];
    loop {
        interface_request(transfer, control_requests::CHECK_CLEAR_STATUS, 0, &mut buffer, timeout)?;
        let fifo_pending = buffer[1] & 0b0000_0001 != 0;
        match buffer[0] {
            usbtmc_status::STATUS_PENDING if fifo_pending => {
                drain_bulk_in(transfer, timeout)?;
            }
            usbtmc_status::STATUS_PENDING => thread::sleep(STATUS_POLL_INTERVAL),
            status => {
                check_status(status)?;
                break;
            }
        }
        if Instant::now() >= deadline {
            if fifo_pending {
                return Err(Error::BulkInFifoNotEmpty.into());
            }
            return Err(Error::Timeout("device did not finish clearing its buffers".into()).into());
        }
    }

    transfer.clear_halts()?;
    debug!("buffers cleared");
    Ok(())
}

/// ### Abort Bulk Out
///
/// Abort the Bulk-OUT transfer tagged `btag`.
///
/// #### Returns
/// The number of bytes the device received before aborting.
///
pub fn abort_bulk_out<T: UsbTransfer + ?Sized>(
    transfer: &mut T,
    btag: u8,
    timeout: Duration,
) -> Result<usize> {
    // INITIATE
    // ==========

    let index = transfer.bulk_out_address() as u16;
    let mut buffer = [0x00; 2];
    transfer.read_control(
        class_request_type(Recipient::Endpoint),
        control_requests::INITIATE_ABORT_BULK_OUT,
        btag as u16,
        index,
        &mut buffer,
        timeout,
    )?;
    if buffer[0] == usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS {
        debug!(btag, "no bulk out transfer in progress");
        return Ok(0);
    }
    check_status(buffer[0])?;

    // CHECK STATUS
    // ==========

    let deadline = Instant::now() + timeout;
    let mut buffer = [0x00; 8];
    loop {
        transfer.read_control(
            class_request_type(Recipient::Endpoint),
            control_requests::CHECK_ABORT_BULK_OUT_STATUS,
            0,
            index,
            &mut buffer,
            timeout,
        )?;
        match buffer[0] {
            usbtmc_status::STATUS_PENDING => thread::sleep(STATUS_POLL_INTERVAL),
            status => {
                check_status(status)?;
                break;
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("bulk out abort did not complete".into()).into());
        }
    }

    transfer.clear_halts()?;
    let received = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    warn!(btag, received, "bulk out transfer aborted");
    Ok(received)
}

/// ### Abort Bulk In
///
/// Abort the Bulk-IN transfer tagged `btag`.
///
/// #### Returns
/// The number of bytes the device sent before aborting.
///
pub fn abort_bulk_in<T: UsbTransfer + ?Sized>(
    transfer: &mut T,
    btag: u8,
    timeout: Duration,
) -> Result<usize> {
    // INITIATE
    // ==========

    let index = transfer.bulk_in_address() as u16;
    let mut buffer = [0x00; 2];
    transfer.read_control(
        class_request_type(Recipient::Endpoint),
        control_requests::INITIATE_ABORT_BULK_IN,
        btag as u16,
        index,
        &mut buffer,
        timeout,
    )?;
    if buffer[0] == usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS {
        debug!(btag, "no bulk in transfer in progress");
        return Ok(0);
    }
    check_status(buffer[0])?;
    drain_bulk_in(transfer, timeout)?;

    // CHECK STATUS
    // ==========

    let deadline = Instant::now() + timeout;
    let mut buffer = [0x00; 8];
    loop {
        transfer.read_control(
            class_request_type(Recipient::Endpoint),
            control_requests::CHECK_ABORT_BULK_IN_STATUS,
            0,
            index,
            &mut buffer,
            timeout,
        )?;
        match buffer[0] {
            usbtmc_status::STATUS_PENDING => {
                if buffer[1] & 0b0000_0001 != 0 {
                    drain_bulk_in(transfer, timeout)?;
                } else {
                    thread::sleep(STATUS_POLL_INTERVAL);
                }
            }
            status => {
                check_status(status)?;
                break;
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("bulk in abort did not complete".into()).into());
        }
    }

    let sent = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    warn!(btag, sent, "bulk in transfer aborted");
    Ok(sent)
}

/// ### Indicator Pulse
///
/// Ask the device to blink its activity indicator.
///
pub fn indicator_pulse<T: UsbTransfer + ?Sized>(transfer: &mut T, timeout: Duration) -> Result<()> {
    let mut buffer = [0x00; 1];
    interface_request(transfer, control_requests::INDICATOR_PULSE, 0, &mut buffer, timeout)?;
    check_status(buffer[0])
}

/// ### Read Status Byte
///
/// USB488 READ_STATUS_BYTE through the control endpoint, tagged `ctl_btag`.
///
pub fn read_status_byte<T: UsbTransfer + ?Sized>(
    transfer: &mut T,
    ctl_btag: u8,
    timeout: Duration,
) -> Result<u8> {
    let mut buffer = [0x00; 3];
    interface_request(
        transfer,
        control_requests::READ_STATUS_BYTE,
        ctl_btag as u16,
        &mut buffer,
        timeout,
    )?;
    check_status(buffer[0])?;

    if buffer[1] != ctl_btag {
        return Err(Error::Protocol(format!(
            "status byte tag mismatch: got {}, expected {}",
            buffer[1], ctl_btag
        ))
        .into());
    }
    Ok(buffer[2])
}
