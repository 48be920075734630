//! ## Serial
//!
//! RS232 and USB virtual COM port interface.
//!
//! Setting changes made through the setters are only recorded and marked pending.
//! The next read or write applies all of them at once.
//!

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::Result;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use super::{InboundBuffer, Interface, InterfaceKind};
use crate::constants::{misc::DEFAULT_TIMEOUT_DURATION, serial::SUPPORTED_BAUD_RATES};
use crate::error::{io_error, Error};

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub fn from_count(bits: u8) -> Result<DataBits> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            _ => Err(Error::Configuration(format!("{bits}-bit format is not supported")).into()),
        }
    }

    pub fn count(&self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl StopBits {
    pub fn from_count(bits: u8) -> Result<StopBits> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            _ => Err(Error::Configuration(format!("{bits} stop bits are not supported")).into()),
        }
    }

    pub fn count(&self) -> u8 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Parity {
    pub(crate) fn letter(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Software => serialport::FlowControl::Software,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

/// ### Serial Config
///
/// Port path and line settings. Defaults to 9600 baud 8N1 without flow control.
///
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Default read timeout
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            timeout: DEFAULT_TIMEOUT_DURATION,
        }
    }
}

impl SerialConfig {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// ### With Mode
    ///
    /// Apply a classic mode string like `8N1` or `7E2`.
    ///
    pub fn with_mode(mut self, mode: &str) -> Result<Self> {
        let chars: Vec<char> = mode.trim().chars().collect();
        let invalid = || Error::Configuration(format!("invalid serial mode '{mode}'"));
        if chars.len() != 3 {
            return Err(invalid().into());
        }
        let digit = |c: char| c.to_digit(10).map(|d| d as u8).ok_or_else(invalid);

        self.data_bits = DataBits::from_count(digit(chars[0])?)?;
        self.parity = match chars[1].to_ascii_uppercase() {
            'N' => Parity::None,
            'O' => Parity::Odd,
            'E' => Parity::Even,
            _ => return Err(invalid().into()),
        };
        self.stop_bits = StopBits::from_count(digit(chars[2])?)?;
        Ok(self)
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mode in the `8N1` notation
    pub fn mode(&self) -> String {
        format!(
            "{}{}{}",
            self.data_bits.count(),
            self.parity.letter(),
            self.stop_bits.count()
        )
    }

    pub fn validate(&self) -> Result<()> {
        check_baud(self.baud_rate)
    }
}

fn check_baud(baud: u32) -> Result<()> {
    if SUPPORTED_BAUD_RATES.contains(&baud) {
        Ok(())
    } else {
        Err(Error::Configuration(format!("baudrate {baud} is not supported")).into())
    }
}

/// ### Serial Interface
///
/// Blocking serial port.
///
pub struct SerialInterface {
    port: Option<Box<dyn SerialPort>>,
    config: SerialConfig,
    update_settings: bool,
    inbound: InboundBuffer,
}

impl fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialInterface")
            .field("path", &self.config.path)
            .field("baud_rate", &self.config.baud_rate)
            .field("mode", &self.config.mode())
            .field("open", &self.port.is_some())
            .field("update_settings", &self.update_settings)
            .finish_non_exhaustive()
    }
}

impl SerialInterface {
    /// ### Open
    ///
    /// Validate `config` and open the port.
    ///
    pub fn open(config: SerialConfig) -> Result<SerialInterface> {
        let mut interface = SerialInterface {
            port: None,
            config,
            update_settings: false,
            inbound: InboundBuffer::new(),
        };
        Interface::open(&mut interface)?;
        Ok(interface)
    }

    /// ### From Port
    ///
    /// Wrap an already opened port. `config` is applied on the first I/O call.
    ///
    pub fn from_port(port: Box<dyn SerialPort>, config: SerialConfig) -> Result<SerialInterface> {
        config.validate()?;
        Ok(SerialInterface {
            port: Some(port),
            config,
            update_settings: true,
            inbound: InboundBuffer::new(),
        })
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    pub fn settings_pending(&self) -> bool {
        self.update_settings
    }

    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        check_baud(baud)?;
        debug!(baud, "setting baudrate");
        self.config.baud_rate = baud;
        self.update_settings = true;
        Ok(())
    }

    pub fn set_data_bits(&mut self, bits: u8) -> Result<()> {
        self.config.data_bits = DataBits::from_count(bits)?;
        debug!(bits, "set number of data bits");
        self.update_settings = true;
        Ok(())
    }

    pub fn set_parity(&mut self, enabled: bool, even: bool) {
        self.config.parity = match (enabled, even) {
            (false, _) => Parity::None,
            (true, true) => Parity::Even,
            (true, false) => Parity::Odd,
        };
        debug!(parity = ?self.config.parity, "set parity");
        self.update_settings = true;
    }

    pub fn set_stop_bits(&mut self, bits: u8) -> Result<()> {
        self.config.stop_bits = StopBits::from_count(bits)?;
        debug!(bits, "set number of stop bits");
        self.update_settings = true;
        Ok(())
    }

    pub fn set_flow_control(&mut self, flow_control: FlowControl) {
        self.config.flow_control = flow_control;
        debug!(?flow_control, "set flow control");
        self.update_settings = true;
    }

    /// ### Apply Settings
    ///
    /// Push the recorded line settings to the port and flush both OS buffers.
    ///
    pub fn apply_settings(&mut self) -> Result<()> {
        let info = self.info();
        let config = self.config.clone();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| Error::not_connected(&info))?;

        debug!(baud = config.baud_rate, mode = %config.mode(), "applying serial settings");
        port.set_baud_rate(config.baud_rate).map_err(Error::from)?;
        port.set_data_bits(config.data_bits.into())
            .map_err(Error::from)?;
        port.set_parity(config.parity.into()).map_err(Error::from)?;
        port.set_stop_bits(config.stop_bits.into())
            .map_err(Error::from)?;
        port.set_flow_control(config.flow_control.into())
            .map_err(Error::from)?;
        port.clear(ClearBuffer::All).map_err(Error::from)?;

        self.update_settings = false;
        Ok(())
    }

    /// Drive the Data Terminal Ready line
    pub fn set_dtr(&mut self, level: bool) -> Result<()> {
        let info = self.info();
        let port = self.port.as_mut().ok_or_else(|| Error::not_connected(&info))?;
        port.write_data_terminal_ready(level).map_err(Error::from)?;
        debug!(level, "DTR");
        Ok(())
    }

    /// Drive the Request To Send line
    pub fn set_rts(&mut self, level: bool) -> Result<()> {
        let info = self.info();
        let port = self.port.as_mut().ok_or_else(|| Error::not_connected(&info))?;
        port.write_request_to_send(level).map_err(Error::from)?;
        debug!(level, "RTS");
        Ok(())
    }

    fn ready_port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        if self.port.is_none() {
            return Err(Error::not_connected(&self.info()).into());
        }
        if self.update_settings {
            self.apply_settings()?;
        }
        let info = self.info();
        self.port
            .as_mut()
            .ok_or_else(|| Error::not_connected(&info).into())
    }
}

impl Interface for SerialInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Serial
    }

    fn open(&mut self) -> Result<()> {
        self.config.validate()?;
        info!(path = %self.config.path, baud = self.config.baud_rate, mode = %self.config.mode(), "opening serial device");

        let port = serialport::new(self.config.path.as_str(), self.config.baud_rate)
            .data_bits(self.config.data_bits.into())
            .parity(self.config.parity.into())
            .stop_bits(self.config.stop_bits.into())
            .flow_control(self.config.flow_control.into())
            .timeout(self.config.timeout)
            .open()
            .map_err(|err| {
                Error::connection(format!(
                    "failed to open device {} ({})",
                    self.config.path, err
                ))
            })?;

        self.port = Some(port);
        self.update_settings = false;
        self.inbound.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            info!(path = %self.config.path, "closed serial device");
        }
        Ok(())
    }

    fn good(&self) -> bool {
        self.port.is_some()
    }

    fn info(&self) -> String {
        format!(
            "serial;{};{};{}",
            self.config.path,
            self.config.baud_rate,
            self.config.mode()
        )
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.ready_port()?;
        port.write_all(data)
            .map_err(|err| io_error(err, "failed to write to device"))?;
        port.flush()
            .map_err(|err| io_error(err, "failed to write to device"))?;
        debug!(bytes = data.len(), "written");
        Ok(data.len())
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.ready_port()?;
        port.set_timeout(timeout).map_err(Error::from)?;
        let n = match port.read(buf) {
            Ok(n) => n,
            Err(err) => return Err(io_error(err, "read timeout occurred").into()),
        };
        if n == 0 {
            // a tty with nothing to deliver reports zero bytes instead of timing out
            return Err(Error::Timeout("read timeout occurred".into()).into());
        }
        debug!(bytes = n, "read");
        Ok(n)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        if let Err(err) = Interface::close(self) {
            warn!(error = %err, "failed to close serial device");
        }
    }
}
