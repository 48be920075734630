//! ## Modbus TCP
//!
//! Register and coil access over a Modbus TCP connection, on top of any
//! [`Interface`]. Frames are built and parsed with `rmodbus`, the MBAP header and
//! the exception responses are checked here.
//!
//! ```no_run
//! use rs_labdev::interface::{TcpIpConfig, TcpIpInterface};
//! use rs_labdev::modbus::ModbusTcp;
//!
//! # fn main() -> anyhow::Result<()> {
//! let comm = TcpIpInterface::open(TcpIpConfig::new("192.168.1.30", 502))?;
//! let mut plc = ModbusTcp::new(comm)?;
//! let temperatures = plc.read_input_registers(1, 0x0100, 4)?;
//! plc.write_single_register(1, 0x0010, 1500)?;
//! # Ok(())
//! # }
//! ```
//!

use std::time::Instant;

use anyhow::Result;
use rmodbus::client::ModbusRequest;
use rmodbus::ModbusProto;
use tracing::{debug, warn};

use crate::constants::modbus::{
    EXCEPTION_FLAG, MAX_MBAP_LENGTH, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS, MBAP_HEADER_SIZE,
};
use crate::error::Error;
use crate::interface::Interface;

/// Offset of the function code in a frame
const FUNCTION: usize = MBAP_HEADER_SIZE + 1;
/// Offset of the byte count of a read response
const BYTE_COUNT: usize = FUNCTION + 1;

/// Modbus function codes used by [`ModbusTcp`]
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Text of a Modbus exception code
pub fn exception_text(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

fn frame_error(err: rmodbus::ErrorKind) -> anyhow::Error {
    Error::Protocol(format!("malformed modbus response ({err})")).into()
}

fn request_error(err: rmodbus::ErrorKind) -> anyhow::Error {
    Error::Configuration(format!("invalid modbus request ({err})")).into()
}

fn check_quantity(quantity: usize, max: u16, what: &str) -> Result<()> {
    if quantity == 0 || quantity > max as usize {
        return Err(Error::Configuration(format!("{quantity} {what} out of range 1..={max}")).into());
    }
    Ok(())
}

/// ### Modbus TCP
///
/// Modbus TCP client owning the interface it talks through.
///
/// Every request carries its own transaction id. Ids start at 0 and wrap after
/// 0xFFFF, so a late answer to an earlier request is detected and rejected.
///
#[derive(Debug)]
pub struct ModbusTcp<I: Interface> {
    comm: I,
    transaction_id: u16,
}

impl<I: Interface> ModbusTcp<I> {
    /// Fails with a connection error if `comm` is not ready
    pub fn new(comm: I) -> Result<Self> {
        if !comm.good() {
            return Err(Error::not_connected(&comm.info()).into());
        }
        Ok(Self {
            comm,
            transaction_id: 0,
        })
    }

    pub fn interface(&self) -> &I {
        &self.comm
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.comm
    }

    pub fn into_inner(self) -> I {
        self.comm
    }

    /// Transaction id of the next request
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    fn request(&self, unit_id: u8) -> ModbusRequest {
        let mut request = ModbusRequest::new(unit_id, ModbusProto::TcpUdp);
        request.tr_id = self.transaction_id;
        request
    }

    /// FC01, read `count` coils starting at `address`
    pub fn read_coils(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        check_quantity(count as usize, MAX_READ_BITS, "coils")?;
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_get_coils(address, count, &mut frame)
            .map_err(request_error)?;
        self.read_bits(&request, &frame, count)
    }

    /// FC02, read `count` discrete inputs starting at `address`
    pub fn read_discrete_inputs(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        check_quantity(count as usize, MAX_READ_BITS, "discrete inputs")?;
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_get_discretes(address, count, &mut frame)
            .map_err(request_error)?;
        self.read_bits(&request, &frame, count)
    }

    /// FC03, read `count` holding registers starting at `address`
    pub fn read_holding_registers(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        check_quantity(count as usize, MAX_READ_REGISTERS, "registers")?;
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_get_holdings(address, count, &mut frame)
            .map_err(request_error)?;
        self.read_registers(&request, &frame, count)
    }

    /// FC04, read `count` input registers starting at `address`
    pub fn read_input_registers(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        check_quantity(count as usize, MAX_READ_REGISTERS, "registers")?;
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_get_inputs(address, count, &mut frame)
            .map_err(request_error)?;
        self.read_registers(&request, &frame, count)
    }

    /// FC05, switch one coil on or off
    pub fn write_single_coil(&mut self, unit_id: u8, address: u16, on: bool) -> Result<()> {
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_set_coil(address, on, &mut frame)
            .map_err(request_error)?;
        self.write(&request, &frame)
    }

    /// FC06, write one holding register
    pub fn write_single_register(&mut self, unit_id: u8, address: u16, value: u16) -> Result<()> {
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_set_holding(address, value, &mut frame)
            .map_err(request_error)?;
        self.write(&request, &frame)
    }

    /// FC15, write consecutive coils starting at `address`
    pub fn write_multiple_coils(&mut self, unit_id: u8, address: u16, values: &[bool]) -> Result<()> {
        check_quantity(values.len(), MAX_WRITE_BITS, "coils")?;
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_set_coils_bulk(address, values, &mut frame)
            .map_err(request_error)?;
        self.write(&request, &frame)
    }

    /// FC16, write consecutive holding registers starting at `address`
    pub fn write_multiple_registers(&mut self, unit_id: u8, address: u16, values: &[u16]) -> Result<()> {
        check_quantity(values.len(), MAX_WRITE_REGISTERS, "registers")?;
        let mut request = self.request(unit_id);
        let mut frame = Vec::new();
        request
            .generate_set_holdings_bulk(address, values, &mut frame)
            .map_err(request_error)?;
        self.write(&request, &frame)
    }

    fn read_registers(&mut self, request: &ModbusRequest, frame: &[u8], count: u16) -> Result<Vec<u16>> {
        let response = self.transact(request, frame)?;
        check_byte_count(&response, count as usize * 2)?;

        let mut values = Vec::new();
        request.parse_u16(&response, &mut values).map_err(frame_error)?;
        if values.len() != count as usize {
            return Err(Error::Protocol(format!("expected {count} registers, got {}", values.len())).into());
        }
        Ok(values)
    }

    fn read_bits(&mut self, request: &ModbusRequest, frame: &[u8], count: u16) -> Result<Vec<bool>> {
        let response = self.transact(request, frame)?;
        check_byte_count(&response, (count as usize + 7) / 8)?;

        let mut values = Vec::new();
        request.parse_bool(&response, &mut values).map_err(frame_error)?;
        values.truncate(count as usize);
        if values.len() != count as usize {
            return Err(Error::Protocol(format!("expected {count} bits, got {}", values.len())).into());
        }
        Ok(values)
    }

    /// The write responses echo function code, address and the value or quantity
    fn write(&mut self, request: &ModbusRequest, frame: &[u8]) -> Result<()> {
        let response = self.transact(request, frame)?;
        let echo = FUNCTION..FUNCTION + 5;
        if response.get(echo.clone()) != frame.get(echo) {
            return Err(Error::Protocol("write response does not echo the request".into()).into());
        }
        request.parse_ok(&response).map_err(frame_error)
    }

    /// ### Transact
    ///
    /// Send one request frame and read the complete response frame.
    ///
    /// The response must carry the transaction id and unit id of the request.
    /// Exception responses fail with a protocol error naming the exception.
    ///
    fn transact(&mut self, request: &ModbusRequest, frame: &[u8]) -> Result<Vec<u8>> {
        self.comm.write_bytes(frame)?;
        self.transaction_id = self.transaction_id.wrapping_add(1);

        let deadline = Instant::now() + self.comm.timeout();
        let mut response = read_exact(&mut self.comm, MBAP_HEADER_SIZE, deadline)?;
        let protocol_id = u16::from_be_bytes([response[2], response[3]]);
        let length = u16::from_be_bytes([response[4], response[5]]) as usize;
        if protocol_id != 0 || !(2..=MAX_MBAP_LENGTH).contains(&length) {
            // the stream cannot be trusted past a bad header
            self.comm.inbound().clear();
            return Err(Error::Protocol(format!(
                "invalid MBAP header (protocol {protocol_id}, length {length})"
            ))
            .into());
        }
        response.extend(read_exact(&mut self.comm, length, deadline)?);

        let transaction_id = u16::from_be_bytes([response[0], response[1]]);
        if transaction_id != request.tr_id {
            warn!(expected = request.tr_id, received = transaction_id, "stale modbus response");
            return Err(Error::Protocol(format!(
                "transaction id {transaction_id} does not match request {}",
                request.tr_id
            ))
            .into());
        }
        if response[MBAP_HEADER_SIZE] != request.unit_id {
            return Err(Error::Protocol(format!(
                "answer from unit {} to a request for unit {}",
                response[MBAP_HEADER_SIZE], request.unit_id
            ))
            .into());
        }

        let function = response[FUNCTION];
        if function & EXCEPTION_FLAG != 0 {
            let code = response.get(FUNCTION + 1).copied().unwrap_or(0);
            return Err(Error::Protocol(format!(
                "modbus exception {code:#04x} on function {:#04x}: {}",
                function & !EXCEPTION_FLAG,
                exception_text(code)
            ))
            .into());
        }
        if function != frame[FUNCTION] {
            return Err(Error::Protocol(format!(
                "function {function:#04x} answers a request for {:#04x}",
                frame[FUNCTION]
            ))
            .into());
        }

        debug!(transaction_id, unit_id = request.unit_id, function, bytes = response.len(), "modbus response");
        Ok(response)
    }
}

fn check_byte_count(response: &[u8], expected: usize) -> Result<()> {
    let data = response.len().saturating_sub(BYTE_COUNT + 1);
    match response.get(BYTE_COUNT) {
        Some(&count) if count as usize == expected && data == expected => Ok(()),
        Some(&count) => Err(Error::Protocol(format!(
            "byte count {count} with {data} data bytes, expected {expected}"
        ))
        .into()),
        None => Err(Error::Protocol("read response without byte count".into()).into()),
    }
}

/// Read exactly `len` bytes, keeping anything beyond them buffered
fn read_exact<I: Interface>(comm: &mut I, len: usize, deadline: Instant) -> Result<Vec<u8>> {
    let mut buf = [0u8; MBAP_HEADER_SIZE + MAX_MBAP_LENGTH];
    while comm.inbound().len() < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout(format!("modbus frame incomplete after {:?}", comm.timeout())).into());
        }
        let n = comm.read_raw(&mut buf, remaining)?;
        comm.inbound().push(&buf[..n]);
    }
    Ok(comm.inbound().take(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorExt, ErrorKind};
    use crate::interface::MockInterface;

    fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = transaction_id.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(pdu);
        frame
    }

    fn client() -> (ModbusTcp<MockInterface>, MockInterface) {
        let mock = MockInterface::new();
        (ModbusTcp::new(mock.clone()).unwrap(), mock)
    }

    #[test]
    fn test_read_holding_registers() {
        let (mut plc, mock) = client();
        mock.queue_response(&frame(0, 1, &[0x03, 4, 0x12, 0x34, 0xAB, 0xCD]));

        let values = plc.read_holding_registers(1, 0x0010, 2).unwrap();
        assert_eq!(values, vec![0x1234, 0xABCD]);
        assert_eq!(
            mock.writes()[0],
            vec![0, 0, 0, 0, 0, 6, 1, 0x03, 0x00, 0x10, 0x00, 0x02]
        );
        assert_eq!(plc.transaction_id(), 1);
    }

    #[test]
    fn test_read_input_registers_split_across_reads() {
        let (mut plc, mock) = client();
        let response = frame(0, 7, &[0x04, 2, 0x01, 0xF4]);
        mock.queue_response(&response[..4]);
        mock.queue_response(&response[4..]);

        assert_eq!(plc.read_input_registers(7, 0x0100, 1).unwrap(), vec![500]);
        assert_eq!(mock.writes()[0][7], function::READ_INPUT_REGISTERS);
    }

    #[test]
    fn test_transaction_id_advances_per_request() {
        let (mut plc, mock) = client();
        mock.queue_response(&frame(0, 1, &[0x06, 0x00, 0x01, 0x00, 0x2A]));
        mock.queue_response(&frame(1, 1, &[0x06, 0x00, 0x02, 0x00, 0x2B]));

        plc.write_single_register(1, 0x0001, 42).unwrap();
        plc.write_single_register(1, 0x0002, 43).unwrap();

        let writes = mock.writes();
        assert_eq!(&writes[0][..2], &[0, 0]);
        assert_eq!(&writes[1][..2], &[0, 1]);
        assert_eq!(&writes[1][7..], &[0x06, 0x00, 0x02, 0x00, 0x2B]);
        assert_eq!(plc.transaction_id(), 2);
    }

    #[test]
    fn test_exception_response_is_protocol_error() {
        let (mut plc, mock) = client();
        mock.queue_response(&frame(0, 1, &[0x83, 0x02]));

        let err = plc.read_holding_registers(1, 0x0500, 1).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
        assert!(err.to_string().contains("illegal data address"));
    }

    #[test]
    fn test_byte_count_mismatch_is_protocol_error() {
        let (mut plc, mock) = client();
        // claims four bytes, carries two
        mock.queue_response(&frame(0, 1, &[0x03, 4, 0x12, 0x34]));

        let err = plc.read_holding_registers(1, 0, 2).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
    }

    #[test]
    fn test_stale_transaction_is_rejected() {
        let (mut plc, mock) = client();
        mock.queue_response(&frame(9, 1, &[0x03, 2, 0x00, 0x01]));

        let err = plc.read_holding_registers(1, 0, 1).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
        assert_eq!(plc.transaction_id(), 1);
    }

    #[test]
    fn test_write_multiple_registers() {
        let (mut plc, mock) = client();
        mock.queue_response(&frame(0, 2, &[0x10, 0x00, 0x20, 0x00, 0x03]));

        plc.write_multiple_registers(2, 0x0020, &[1, 2, 0x0300]).unwrap();
        assert_eq!(
            &mock.writes()[0][7..],
            &[0x10, 0x00, 0x20, 0x00, 0x03, 6, 0, 1, 0, 2, 0x03, 0x00]
        );
    }

    #[test]
    fn test_coils() {
        let (mut plc, mock) = client();
        mock.queue_response(&frame(0, 1, &[0x01, 1, 0b0000_0101]));
        mock.queue_response(&frame(1, 1, &[0x05, 0x00, 0x03, 0xFF, 0x00]));

        assert_eq!(plc.read_coils(1, 0, 3).unwrap(), vec![true, false, true]);
        plc.write_single_coil(1, 3, true).unwrap();
        assert_eq!(&mock.writes()[1][7..], &[0x05, 0x00, 0x03, 0xFF, 0x00]);
    }

    #[test]
    fn test_quantity_limits() {
        let (mut plc, mock) = client();
        let err = plc.read_holding_registers(1, 0, 0).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Configuration));
        let err = plc.write_multiple_registers(1, 0, &[0; 124]).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Configuration));
        assert!(mock.writes().is_empty());
    }

    #[test]
    fn test_missing_response_times_out() {
        let (mut plc, _mock) = client();
        let err = plc.read_input_registers(1, 0, 1).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_requires_ready_interface() {
        let mock = MockInterface::new();
        mock.disconnect();
        let err = ModbusTcp::new(mock).err().unwrap();
        assert_eq!(err.kind(), Some(ErrorKind::Connection));
    }
}
