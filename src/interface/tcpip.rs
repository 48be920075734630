//! ## TCP/IP
//!
//! Raw socket interface, e.g. SCPI over port 5025 or a serial-to-ethernet bridge.
//!

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::Result;
use socket2::SockRef;
use tracing::{debug, info, warn};

use super::{InboundBuffer, Interface, InterfaceKind};
use crate::constants::misc::{DEFAULT_BUFFER_SIZE, DEFAULT_TIMEOUT_DURATION};
use crate::error::{io_error, Error};

/// ### TCP/IP Config
///
/// Address of the instrument.
///
#[derive(Debug, Clone)]
pub struct TcpIpConfig {
    /// Host name or IP address
    pub address: String,
    pub port: u16,
    /// Default read timeout, also used as the connect and write timeout
    pub timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// SO_RCVBUF requested on open, `None` keeps the system default
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF requested on open, `None` keeps the system default
    pub send_buffer_size: Option<usize>,
}

impl TcpIpConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            timeout: DEFAULT_TIMEOUT_DURATION,
            nodelay: true,
            recv_buffer_size: Some(DEFAULT_BUFFER_SIZE),
            send_buffer_size: Some(DEFAULT_BUFFER_SIZE),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The kernel may round or clamp the sizes
    pub fn with_buffer_sizes(mut self, recv: Option<usize>, send: Option<usize>) -> Self {
        self.recv_buffer_size = recv;
        self.send_buffer_size = send;
        self
    }

    fn resolve(&self) -> Result<SocketAddr> {
        (self.address.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "address {}:{} is not supported",
                    self.address, self.port
                ))
                .into()
            })
    }
}

/// ### TCP/IP Interface
///
/// Blocking TCP stream to an instrument.
///
#[derive(Debug)]
pub struct TcpIpInterface {
    stream: Option<TcpStream>,
    config: TcpIpConfig,
    inbound: InboundBuffer,
}

impl TcpIpInterface {
    pub fn open(config: TcpIpConfig) -> Result<TcpIpInterface> {
        let mut interface = TcpIpInterface::new(config);
        Interface::open(&mut interface)?;
        Ok(interface)
    }

    /// Interface that connects on the first [`Interface::open`]
    pub fn new(config: TcpIpConfig) -> TcpIpInterface {
        TcpIpInterface {
            stream: None,
            config,
            inbound: InboundBuffer::new(),
        }
    }

    pub fn config(&self) -> &TcpIpConfig {
        &self.config
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        match self.stream {
            Some(ref mut stream) => Ok(stream),
            None => Err(Error::not_connected(&format!(
                "tcpip;{};{}",
                self.config.address, self.config.port
            ))
            .into()),
        }
    }
}

impl Interface for TcpIpInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::TcpIp
    }

    fn open(&mut self) -> Result<()> {
        let addr = self.config.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.config.timeout).map_err(|err| {
            io_error(
                err,
                &format!(
                    "failed to connect to {}:{}",
                    self.config.address, self.config.port
                ),
            )
        })?;
        if self.config.nodelay {
            stream
                .set_nodelay(true)
                .map_err(|err| io_error(err, "failed to set TCP_NODELAY"))?;
        }

        // SOCKET OPTIONS
        // ==========

        let socket = SockRef::from(&stream);
        if let Some(size) = self.config.recv_buffer_size {
            socket
                .set_recv_buffer_size(size)
                .map_err(|err| io_error(err, &format!("failed to set receive buffer to {size}")))?;
        }
        if let Some(size) = self.config.send_buffer_size {
            socket
                .set_send_buffer_size(size)
                .map_err(|err| io_error(err, &format!("failed to set send buffer to {size}")))?;
        }
        stream
            .set_write_timeout(Some(socket_timeout(self.config.timeout)))
            .map_err(|err| io_error(err, "failed to set write timeout"))?;
        info!(%addr, "connected");

        self.stream = Some(stream);
        self.inbound.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            // the peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
            info!(address = %self.config.address, port = self.config.port, "disconnected");
        }
        Ok(())
    }

    fn good(&self) -> bool {
        self.stream.is_some()
    }

    fn info(&self) -> String {
        format!("tcpip;{};{}", self.config.address, self.config.port)
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
        if let Some(stream) = &self.stream {
            if let Err(err) = stream.set_write_timeout(Some(socket_timeout(timeout))) {
                warn!(%err, "failed to update write timeout");
            }
        }
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream()?;
        stream
            .write_all(data)
            .map_err(|err| io_error(err, "failed to write to device"))?;
        debug!(bytes = data.len(), "written");
        Ok(data.len())
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream()?;
        stream
            .set_read_timeout(Some(socket_timeout(timeout)))
            .map_err(|err| io_error(err, "failed to set read timeout"))?;

        let n = stream
            .read(buf)
            .map_err(|err| io_error(err, "read timeout occurred"))?;
        if n == 0 && !buf.is_empty() {
            self.stream = None;
            return Err(Error::connection(format!("{} closed the connection", self.info())).into());
        }
        debug!(bytes = n, "read");
        Ok(n)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }
}

/// A zero duration would be rejected by the socket
fn socket_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

impl Drop for TcpIpInterface {
    fn drop(&mut self) {
        let _ = Interface::close(self);
    }
}
