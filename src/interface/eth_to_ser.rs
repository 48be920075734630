//! ## Ethernet to Serial
//!
//! Serial line behind an Ethernet bridge (Waveshare style). Data goes through a
//! raw TCP port, the line settings are stored by posting a form to the web server
//! of the bridge. The bridge restarts its TCP server on every change, so applying
//! settings drops and reopens the data connection.
//!
//! Like the serial interface, setters only record the change. The next read or
//! write applies all of them at once.
//!

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};
use ureq::Agent;

use super::serial::{DataBits, Parity, SerialConfig, StopBits};
use super::{InboundBuffer, Interface, InterfaceKind, TcpIpConfig, TcpIpInterface};
use crate::constants::eth_to_ser::{BAUD_CODES, HTTP_PORT, RESTART_DELAY, SETTINGS_PATH};
use crate::constants::misc::DEFAULT_TIMEOUT_DURATION;
use crate::error::{io_error, Error};

/// Hardware handshake offered by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    None,
    RtsCts,
    DtrDsr,
}

impl Handshake {
    fn code(&self) -> u8 {
        match self {
            Handshake::None => 0,
            Handshake::RtsCts => 1,
            Handshake::DtrDsr => 2,
        }
    }
}

/// ### Eth To Serial Config
///
/// Bridge address and the line settings it should use. Defaults to 9600 baud
/// 8N1 without handshake.
///
#[derive(Debug, Clone)]
pub struct EthToSerialConfig {
    /// Host name or IP address of the bridge
    pub address: String,
    /// Raw TCP port carrying the serial data
    pub port: u16,
    /// Port of the configuration web server
    pub http_port: u16,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub handshake: Handshake,
    /// Default read timeout, also bounds the settings request
    pub timeout: Duration,
}

impl EthToSerialConfig {
    pub fn new(address: impl Into<String>, port: u16, baud_rate: u32) -> Self {
        Self {
            address: address.into(),
            port,
            http_port: HTTP_PORT,
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            handshake: Handshake::None,
            timeout: DEFAULT_TIMEOUT_DURATION,
        }
    }

    /// Apply a mode string like `8N1` or `7E2`
    pub fn with_mode(mut self, mode: &str) -> Result<Self> {
        let line = SerialConfig::default().with_mode(mode)?;
        self.data_bits = line.data_bits;
        self.parity = line.parity;
        self.stop_bits = line.stop_bits;
        Ok(self)
    }

    pub fn with_http_port(mut self, http_port: u16) -> Self {
        self.http_port = http_port;
        self
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
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

    fn data_channel(&self) -> TcpIpConfig {
        TcpIpConfig::new(self.address.clone(), self.port).with_timeout(self.timeout)
    }
}

fn baud_code(baud: u32) -> Result<&'static str> {
    BAUD_CODES
        .iter()
        .find(|(rate, _)| *rate == baud)
        .map(|(_, code)| *code)
        .ok_or_else(|| Error::Configuration(format!("baudrate {baud} is not supported by the bridge")).into())
}

/// ### Settings Form
///
/// Body of the form post that stores the line settings in the bridge.
///
pub fn settings_form(config: &EthToSerialConfig) -> Result<String> {
    let data_bits = match config.data_bits {
        DataBits::Eight => 0,
        DataBits::Seven => 1,
        DataBits::Six => 2,
        DataBits::Five => 3,
    };
    let parity = match config.parity {
        Parity::None => 0,
        Parity::Odd => 1,
        Parity::Even => 2,
    };
    let stop_bits = match config.stop_bits {
        StopBits::One => 0,
        StopBits::Two => 1,
    };
    Ok(format!(
        "bdr={}&dtb={}&prt={}&stb={}&flc={}&rtp=&post=Submit",
        baud_code(config.baud_rate)?,
        data_bits,
        parity,
        stop_bits,
        config.handshake.code()
    ))
}

fn http_error(err: ureq::Error, url: &str) -> anyhow::Error {
    match err {
        ureq::Error::StatusCode(status) => {
            Error::Protocol(format!("{url} answered with HTTP status {status}")).into()
        }
        ureq::Error::Io(err) => io_error(err, &format!("failed to reach {url}")).into(),
        ureq::Error::Timeout(_) => Error::Timeout(format!("no answer from {url}")).into(),
        err => Error::connection(format!("failed to reach {url} ({err})")).into(),
    }
}

/// ### Eth To Serial Interface
///
/// Serial instrument reached through an Ethernet bridge.
///
#[derive(Debug)]
pub struct EthToSerialInterface {
    data: TcpIpInterface,
    config: EthToSerialConfig,
    update_settings: bool,
}

impl EthToSerialInterface {
    /// ### Open
    ///
    /// Store the line settings in the bridge, then connect to its data port.
    ///
    pub fn open(config: EthToSerialConfig) -> Result<EthToSerialInterface> {
        let mut interface = EthToSerialInterface {
            data: TcpIpInterface::new(config.data_channel()),
            config,
            update_settings: true,
        };
        Interface::open(&mut interface)?;
        Ok(interface)
    }

    pub fn config(&self) -> &EthToSerialConfig {
        &self.config
    }

    pub fn settings_pending(&self) -> bool {
        self.update_settings
    }

    pub fn set_baud(&mut self, baud: u32) -> Result<()> {
        baud_code(baud)?;
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

    pub fn set_handshake(&mut self, handshake: Handshake) {
        self.config.handshake = handshake;
        debug!(?handshake, "set handshake");
        self.update_settings = true;
    }

    /// The bridge offers no way to drive DTR
    pub fn set_dtr(&mut self, _level: bool) -> Result<()> {
        Err(Error::Configuration("setting DTR is not supported by the bridge".into()).into())
    }

    /// The bridge offers no way to drive RTS
    pub fn set_rts(&mut self, _level: bool) -> Result<()> {
        Err(Error::Configuration("setting RTS is not supported by the bridge".into()).into())
    }

    /// ### Apply Settings
    ///
    /// Post the recorded line settings to the bridge and reconnect the data
    /// channel once its TCP server is back.
    ///
    pub fn apply_settings(&mut self) -> Result<()> {
        let form = settings_form(&self.config)?;
        Interface::close(&mut self.data)?;

        let url = format!(
            "http://{}:{}{}",
            self.config.address, self.config.http_port, SETTINGS_PATH
        );
        debug!(%url, %form, "applying bridge settings");
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(self.config.timeout))
            .build()
            .into();
        let mut response = agent
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .send(form.as_str())
            .map_err(|err| http_error(err, &url))?;
        response
            .body_mut()
            .read_to_string()
            .map_err(|err| http_error(err, &url))?;

        thread::sleep(RESTART_DELAY);
        Interface::open(&mut self.data)?;
        self.update_settings = false;
        info!(bridge = %self.config.address, baud = self.config.baud_rate, mode = %self.config.mode(), "bridge settings applied");
        Ok(())
    }

    fn ready(&mut self) -> Result<&mut TcpIpInterface> {
        if self.update_settings {
            self.apply_settings()?;
        }
        Ok(&mut self.data)
    }
}

impl Interface for EthToSerialInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::EthToSerial
    }

    fn open(&mut self) -> Result<()> {
        self.apply_settings()
    }

    fn close(&mut self) -> Result<()> {
        Interface::close(&mut self.data)
    }

    fn good(&self) -> bool {
        self.data.good()
    }

    /// `serial;<address>:<port>;<baud>;<mode>`
    fn info(&self) -> String {
        format!(
            "serial;{}:{};{};{}",
            self.config.address,
            self.config.port,
            self.config.baud_rate,
            self.config.mode()
        )
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
        self.data.set_timeout(timeout);
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        if !self.data.good() && !self.update_settings {
            return Err(Error::not_connected(&self.info()).into());
        }
        self.ready()?.write_raw(data)
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.data.good() && !self.update_settings {
            return Err(Error::not_connected(&self.info()).into());
        }
        self.ready()?.read_raw(buf, timeout)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        self.data.inbound()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorExt, ErrorKind};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Read one HTTP request and return its body
    fn read_request(stream: &mut TcpStream) -> (String, String) {
        let mut request = Vec::new();
        let mut byte = [0u8];
        while !request.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            request.push(byte[0]);
        }
        let head = String::from_utf8(request).unwrap();
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().unwrap())
            })
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).unwrap();
        (head, String::from_utf8(body).unwrap())
    }

    fn answer(stream: &mut TcpStream, status: &str) {
        let reply = format!("HTTP/1.1 {status}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK");
        stream.write_all(reply.as_bytes()).unwrap();
    }

    fn bridge() -> (TcpListener, TcpListener, EthToSerialConfig) {
        let web = TcpListener::bind("127.0.0.1:0").unwrap();
        let data = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = EthToSerialConfig::new("127.0.0.1", data.local_addr().unwrap().port(), 9600)
            .with_http_port(web.local_addr().unwrap().port())
            .with_timeout(Duration::from_secs(2));
        (web, data, config)
    }

    #[test]
    fn test_settings_form() {
        let config = EthToSerialConfig::new("10.0.0.7", 5555, 9600);
        assert_eq!(
            settings_form(&config).unwrap(),
            "bdr=4&dtb=0&prt=0&stb=0&flc=0&rtp=&post=Submit"
        );

        let config = EthToSerialConfig::new("10.0.0.7", 5555, 115200)
            .with_mode("7E2")
            .unwrap()
            .with_handshake(Handshake::DtrDsr);
        assert_eq!(
            settings_form(&config).unwrap(),
            "bdr=B&dtb=1&prt=2&stb=1&flc=2&rtp=&post=Submit"
        );
    }

    #[test]
    fn test_unsupported_baud_is_configuration_error() {
        let config = EthToSerialConfig::new("10.0.0.7", 5555, 230400);
        let err = settings_form(&config).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Configuration));

        // rejected before anything goes on the network
        let err = EthToSerialInterface::open(config).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Configuration));
    }

    #[test]
    fn test_open_configures_then_queries() {
        let (web, data, config) = bridge();
        let server = thread::spawn(move || {
            let (mut stream, _) = web.accept().unwrap();
            let (head, body) = read_request(&mut stream);
            answer(&mut stream, "200 OK");

            let (stream, _) = data.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "VOLT?\n" {
                (&stream).write_all(b"5.000\n").unwrap();
            }
            (head, body)
        });

        let mut interface = EthToSerialInterface::open(config).unwrap();
        assert!(interface.good());
        assert!(!interface.settings_pending());
        let reply = interface.query("VOLT?\n", Duration::from_secs(2)).unwrap();
        assert_eq!(reply, "5.000\n");

        let (head, body) = server.join().unwrap();
        assert!(head.starts_with("POST /ok.html HTTP/1.1\r\n"));
        assert_eq!(body, "bdr=4&dtb=0&prt=0&stb=0&flc=0&rtp=&post=Submit");
        assert_eq!(
            interface.info(),
            format!("serial;127.0.0.1:{};9600;8N1", interface.config().port)
        );
    }

    #[test]
    fn test_pending_settings_reconnect_on_write() {
        let (web, data, config) = bridge();
        let server = thread::spawn(move || {
            let mut bodies = Vec::new();
            for _ in 0..2 {
                let (mut stream, _) = web.accept().unwrap();
                bodies.push(read_request(&mut stream).1);
                answer(&mut stream, "200 OK");
            }
            bodies
        });
        let device = thread::spawn(move || {
            let _first = data.accept().unwrap();
            let (stream, _) = data.accept().unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).unwrap();
            line
        });

        let mut interface = EthToSerialInterface::open(config).unwrap();
        interface.set_baud(19200).unwrap();
        interface.set_parity(true, false);
        assert!(interface.settings_pending());
        assert!(interface.set_baud(300).is_err());
        assert_eq!(interface.info(), format!("serial;127.0.0.1:{};19200;8O1", interface.config().port));

        interface.write("OUTP ON\n").unwrap();
        assert!(!interface.settings_pending());

        let bodies = server.join().unwrap();
        assert_eq!(bodies[1], "bdr=6&dtb=0&prt=1&stb=0&flc=0&rtp=&post=Submit");
        assert_eq!(device.join().unwrap(), "OUTP ON\n");
    }

    #[test]
    fn test_rejected_settings_are_protocol_error() {
        let (web, _data, config) = bridge();
        let server = thread::spawn(move || {
            let (mut stream, _) = web.accept().unwrap();
            read_request(&mut stream);
            answer(&mut stream, "404 Not Found");
        });

        let err = EthToSerialInterface::open(config).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Protocol));
        server.join().unwrap();
    }

    #[test]
    fn test_line_control_is_unsupported() {
        let config = EthToSerialConfig::new("10.0.0.7", 5555, 9600);
        let mut interface = EthToSerialInterface {
            data: TcpIpInterface::new(config.data_channel()),
            config,
            update_settings: false,
        };
        assert_eq!(
            interface.set_dtr(true).unwrap_err().kind(),
            Some(ErrorKind::Configuration)
        );
        assert_eq!(
            interface.set_rts(false).unwrap_err().kind(),
            Some(ErrorKind::Configuration)
        );
        assert_eq!(
            interface.write("*RST\n").unwrap_err().kind(),
            Some(ErrorKind::Connection)
        );
        assert_eq!(interface.kind(), InterfaceKind::EthToSerial);
    }
}
