//! ## VISA
//!
//! Instruments reached through an installed VISA library (feature `visa`).
//!

use std::ffi::CString;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};
use visa_rs::prelude::*;

use super::{InboundBuffer, Interface, InterfaceKind};
use crate::constants::misc::DEFAULT_TIMEOUT_DURATION;
use crate::error::{io_error, Error};

/// ### VISA Config
///
/// Resource string such as `TCPIP0::192.168.1.20::INSTR` or `USB0::0x1AB1::0x04CE::DS1ZA1234::INSTR`.
///
#[derive(Debug, Clone)]
pub struct VisaConfig {
    pub resource: String,
    pub timeout: Duration,
}

impl VisaConfig {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: DEFAULT_TIMEOUT_DURATION,
        }
    }
}

pub struct VisaInterface {
    config: VisaConfig,
    // the session must go before its resource manager
    session: Option<Instrument>,
    rm: Option<DefaultRM>,
    inbound: InboundBuffer,
}

impl VisaInterface {
    pub fn open(config: VisaConfig) -> Result<VisaInterface> {
        let mut interface = VisaInterface {
            config,
            session: None,
            rm: None,
            inbound: InboundBuffer::new(),
        };
        Interface::open(&mut interface)?;
        Ok(interface)
    }

    fn session(&mut self) -> Result<&mut Instrument> {
        match self.session {
            Some(ref mut session) => Ok(session),
            None => Err(Error::not_connected(&format!("visa;{}", self.config.resource)).into()),
        }
    }

    fn set_visa_timeout(&mut self, timeout: Duration) -> Result<()> {
        let millis = timeout.as_millis().clamp(1, u32::MAX as u128) as u32;
        let attr = visa_rs::attribute::AttrTmoValue::new_checked(millis)
            .ok_or_else(|| Error::Configuration(format!("timeout {millis} ms not supported")))?;
        self.session()?
            .set_attr(attr)
            .map_err(|err| Error::Configuration(format!("failed to set VISA timeout: {err:?}")))?;
        Ok(())
    }

    /// ### Clear Device
    ///
    /// Device clear (viClear): flush the instrument's input and output buffers.
    ///
    pub fn clear_device(&mut self) -> Result<()> {
        self.session()?
            .clear()
            .map_err(|err| Error::Io {
                message: format!("device clear failed: {err:?}"),
                code: None,
            })?;
        self.inbound.clear();
        debug!(resource = %self.config.resource, "device cleared");
        Ok(())
    }
}

impl Interface for VisaInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Visa
    }

    fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let rm = DefaultRM::new()
            .map_err(|err| Error::connection(format!("no VISA resource manager: {err:?}")))?;
        let resource = CString::new(self.config.resource.as_str())
            .map_err(|_| Error::Configuration(format!("invalid resource {:?}", self.config.resource)))?;
        let resource = VisaString::from(resource);
        let session = rm
            .open(&resource, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .map_err(|err| Error::connection(format!("failed to open {}: {err:?}", self.config.resource)))?;

        self.session = Some(session);
        self.rm = Some(rm);
        self.inbound.clear();
        info!(resource = %self.config.resource, "visa session opened");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.session.take().is_some() {
            info!(resource = %self.config.resource, "visa session closed");
        }
        self.rm = None;
        Ok(())
    }

    fn good(&self) -> bool {
        self.session.is_some()
    }

    fn info(&self) -> String {
        format!("visa;{}", self.config.resource)
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        let session = self.session()?;
        session
            .write_all(data)
            .map_err(|err| io_error(err, "failed to write to device"))?;
        Ok(data.len())
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.set_visa_timeout(timeout)?;
        let session = self.session()?;
        let n = session
            .read(buf)
            .map_err(|err| io_error(err, "read timeout occurred"))?;
        Ok(n)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }
}

impl Drop for VisaInterface {
    fn drop(&mut self) {
        let _ = Interface::close(self);
    }
}
