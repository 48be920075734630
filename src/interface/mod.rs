//! ## Interfaces
//!
//! Byte channels to an instrument and the framed I/O built on top of them.
//!
//! Every transport implements [`Interface`]: the raw primitives
//! ([`Interface::write_raw`], [`Interface::read_raw`]) plus the life cycle
//! (`open`/`close`/`good`). The string helpers (`write`, `read`, `read_until`,
//! `query`) are provided on top and behave identically on every transport.
//!
//! An interface is owned by exactly one user. Nothing in here locks, so sharing
//! one handle between threads has to be serialized by the caller.
//!

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::debug;

use crate::constants::misc::DEFAULT_BUFFER_SIZE;
use crate::error::Error;

pub mod eth_to_ser;
pub mod mock;
pub mod serial;
pub mod tcpip;
pub mod usb;
pub mod usbtmc;
#[cfg(feature = "visa")]
pub mod visa;

pub use eth_to_ser::{EthToSerialConfig, EthToSerialInterface, Handshake};
pub use mock::{MockInterface, MockUsbTransfer};
pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialInterface, StopBits};
pub use tcpip::{TcpIpConfig, TcpIpInterface};
pub use usb::{UsbConfig, UsbInterface, UsbTarget, UsbTransfer};
pub use usbtmc::UsbtmcInterface;
#[cfg(feature = "visa")]
pub use visa::{VisaConfig, VisaInterface};

/// ### Interface Kind
///
/// The transport behind an [`Interface`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Serial,
    EthToSerial,
    TcpIp,
    Usb,
    Usbtmc,
    Visa,
    Mock,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterfaceKind::Serial => "serial",
            InterfaceKind::EthToSerial => "eth_to_ser",
            InterfaceKind::TcpIp => "tcpip",
            InterfaceKind::Usb => "usb",
            InterfaceKind::Usbtmc => "usbtmc",
            InterfaceKind::Visa => "visa",
            InterfaceKind::Mock => "mock",
        };
        f.write_str(name)
    }
}

/// ### Inbound Buffer
///
/// Bytes received from the wire but not yet handed to a caller.
///
/// Bytes are consumed left to right and never pushed back.
///
#[derive(Debug, Default, Clone)]
pub struct InboundBuffer {
    data: Vec<u8>,
}

impl InboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Take everything buffered so far
    pub fn take_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Take up to `max_len` bytes from the front
    pub fn take(&mut self, max_len: usize) -> Vec<u8> {
        let n = max_len.min(self.data.len());
        self.data.drain(..n).collect()
    }

    /// ### Split At Delimiter
    ///
    /// If `delim` is buffered, remove and return the text in front of its first
    /// occurrence together with that position. The delimiter itself is dropped,
    /// the bytes behind it stay. Bytes that are not valid UTF-8 are left untouched.
    ///
    pub fn split_at_delimiter(&mut self, delim: &[u8]) -> Result<Option<(String, usize)>> {
        let pos = match find(&self.data, delim) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let text = std::str::from_utf8(&self.data[..pos])
            .map_err(|err| Error::Protocol(format!("response is not valid UTF-8: {err}")))?
            .to_owned();
        self.data.drain(..pos + delim.len());
        Ok(Some((text, pos)))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Shortened printable form of a payload for log output
pub(crate) fn preview(data: &[u8]) -> String {
    if data.len() > 100 {
        format!(
            "{} [...] {}",
            String::from_utf8_lossy(&data[..50]),
            String::from_utf8_lossy(&data[data.len() - 50..])
        )
    } else {
        String::from_utf8_lossy(data).into_owned()
    }
}

/// ### Interface
///
/// A byte oriented channel to one instrument.
///
pub trait Interface {
    /// The transport behind this interface
    fn kind(&self) -> InterfaceKind;

    /// Open the interface again with the stored settings
    fn open(&mut self) -> Result<()>;

    /// Release the channel. Closing twice is not an error.
    fn close(&mut self) -> Result<()>;

    /// True if the channel is open and usable
    fn good(&self) -> bool;

    /// Human readable description, e.g. `serial;/dev/ttyUSB0;9600;8N1`
    fn info(&self) -> String;

    /// Default read timeout
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    /// Write all of `data`, returns the number of bytes written
    fn write_raw(&mut self, data: &[u8]) -> Result<usize>;

    /// ### Read Raw
    ///
    /// Read at most `buf.len()` bytes, waiting up to `timeout` for the first one.
    ///
    /// Fails with a timeout error if nothing arrives in time.
    ///
    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Bytes received but not yet consumed by the framed readers
    fn inbound(&mut self) -> &mut InboundBuffer;

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.write_raw(data)?;
        debug!(bytes = data.len(), message = %preview(data), "sent message");
        Ok(())
    }

    fn write(&mut self, msg: &str) -> Result<()> {
        self.write_bytes(msg.as_bytes())
    }

    /// ### Read Bytes
    ///
    /// Return pending inbound bytes if there are any, else perform one raw read.
    ///
    fn read_bytes(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        if !self.inbound().is_empty() {
            return Ok(self.inbound().take_all());
        }
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        let n = self.read_raw(&mut buf, timeout)?;
        buf.truncate(n);
        debug!(bytes = n, message = %preview(&buf), "read message");
        Ok(buf)
    }

    fn read(&mut self, timeout: Duration) -> Result<String> {
        let bytes = self.read_bytes(timeout)?;
        decode(bytes)
    }

    /// ### Read Until
    ///
    /// Accumulate reads until `delim` appears and return the text in front of it
    /// together with its position.
    ///
    /// Partial reads are kept and concatenated. Whatever follows the delimiter stays
    /// buffered for the next read. `timeout` bounds the whole accumulation: every
    /// underlying read only gets the time that is left.
    ///
    fn read_until_pos(&mut self, delim: &str, timeout: Duration) -> Result<(String, usize)> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];

        loop {
            if let Some(found) = self.inbound().split_at_delimiter(delim.as_bytes())? {
                return Ok(found);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!("delimiter {delim:?} not received")).into());
            }

            let n = self.read_raw(&mut buf, remaining)?;
            self.inbound().push(&buf[..n]);
        }
    }

    fn read_until(&mut self, delim: &str, timeout: Duration) -> Result<String> {
        self.read_until_pos(delim, timeout).map(|(text, _)| text)
    }

    /// Write `msg` and read the reply. Not atomic with respect to other users.
    fn query(&mut self, msg: &str, timeout: Duration) -> Result<String> {
        self.write(msg)?;
        self.read(timeout)
    }

    fn query_bytes(&mut self, data: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.write_bytes(data)?;
        self.read_bytes(timeout)
    }
}

fn decode(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|err| Error::Protocol(format!("response is not valid UTF-8: {err}")).into())
}

impl<I: Interface + ?Sized> Interface for Box<I> {
    fn kind(&self) -> InterfaceKind {
        (**self).kind()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn good(&self) -> bool {
        (**self).good()
    }

    fn info(&self) -> String {
        (**self).info()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write_raw(data)
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_raw(buf, timeout)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        (**self).inbound()
    }
}

/// ### Interface Config
///
/// Connection parameters for any supported transport.
///
#[derive(Debug, Clone)]
pub enum InterfaceConfig {
    Serial(SerialConfig),
    EthToSerial(EthToSerialConfig),
    TcpIp(TcpIpConfig),
    Usb(UsbConfig),
    Usbtmc(UsbConfig),
    #[cfg(feature = "visa")]
    Visa(VisaConfig),
}

/// ### Open Interface
///
/// Open the transport described by `config`.
///
pub fn open_interface(config: InterfaceConfig) -> Result<Box<dyn Interface>> {
    Ok(match config {
        InterfaceConfig::Serial(config) => Box::new(SerialInterface::open(config)?),
        InterfaceConfig::EthToSerial(config) => Box::new(EthToSerialInterface::open(config)?),
        InterfaceConfig::TcpIp(config) => Box::new(TcpIpInterface::open(config)?),
        InterfaceConfig::Usb(config) => Box::new(UsbInterface::open(config)?),
        InterfaceConfig::Usbtmc(config) => Box::new(UsbtmcInterface::<UsbInterface>::open(config)?),
        #[cfg(feature = "visa")]
        InterfaceConfig::Visa(config) => Box::new(VisaInterface::open(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorExt, ErrorKind};

    #[test]
    fn test_inbound_split() {
        let mut inbound = InboundBuffer::new();
        inbound.push(b"ab");
        assert_eq!(inbound.split_at_delimiter(b",").unwrap(), None);
        inbound.push(b"c,de");
        assert_eq!(
            inbound.split_at_delimiter(b",").unwrap(),
            Some(("abc".to_string(), 3))
        );
        assert_eq!(inbound.take_all(), b"de".to_vec());
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_read_until_accumulates() {
        let mut mock = MockInterface::new();
        mock.queue_str("ab");
        mock.queue_str("c,de");

        let (text, pos) = mock
            .read_until_pos(",", Duration::from_millis(100))
            .unwrap();
        assert_eq!(text, "abc");
        assert_eq!(pos, 3);

        // remainder is served by the next read
        assert_eq!(mock.read(Duration::from_millis(100)).unwrap(), "de");
    }

    #[test]
    fn test_read_until_multichar_delimiter_across_reads() {
        let mut mock = MockInterface::new();
        mock.queue_str("1.5\r");
        mock.queue_str("\n2.5\r\n");

        let timeout = Duration::from_millis(100);
        assert_eq!(mock.read_until("\r\n", timeout).unwrap(), "1.5");
        assert_eq!(mock.read_until("\r\n", timeout).unwrap(), "2.5");
    }

    #[test]
    fn test_read_until_timeout_keeps_partial() {
        let mut mock = MockInterface::new();
        mock.queue_str("abc");

        let err = mock
            .read_until(";", Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));

        mock.queue_str("d;");
        assert_eq!(
            mock.read_until(";", Duration::from_millis(50)).unwrap(),
            "abcd"
        );
    }

    #[test]
    fn test_query_writes_then_reads() {
        let mut mock = MockInterface::new();
        mock.respond_to("VOLT?\n", "5.000\n");

        let reply = mock.query("VOLT?\n", Duration::from_millis(100)).unwrap();
        assert_eq!(reply, "5.000\n");
        assert_eq!(mock.writes(), vec![b"VOLT?\n".to_vec()]);
    }

    #[test]
    fn test_invalid_utf8_is_protocol_error() {
        let mut mock = MockInterface::new();
        mock.queue_response(&[0xFF, 0xFE]);
        let err = mock.read(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
    }

    #[test]
    fn test_read_until_invalid_utf8_stays_buffered() {
        let mut mock = MockInterface::new();
        mock.queue_response(&[0xFF, b',', b'o', b'k']);

        let timeout = Duration::from_millis(10);
        let err = mock.read_until(",", timeout).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
        assert_eq!(mock.inbound().len(), 4);

        // raw bytes are still there for the caller to inspect
        assert_eq!(mock.read_bytes(timeout).unwrap(), vec![0xFF, b',', b'o', b'k']);
    }

    #[test]
    fn test_preview_shortens_long_messages() {
        let data = vec![b'x'; 300];
        let text = preview(&data);
        assert!(text.contains("[...]"));
        assert_eq!(text.len(), 50 + 7 + 50);
    }
}
