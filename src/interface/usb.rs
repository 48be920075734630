//! ## USB
//!
//! Raw bulk transfers to a claimed USB interface.
//!
//! [`UsbTransfer`] is the seam the USBTMC layer sits on. [`UsbInterface`] is the
//! libusb backed implementation, `MockUsbTransfer` the scripted one.
//!

use std::time::Duration;

use anyhow::Result;
use rusb::{Context, DeviceHandle};
use tracing::{debug, info, warn};

use super::{InboundBuffer, Interface, InterfaceKind};
use crate::constants::misc::DEFAULT_TIMEOUT_DURATION;
use crate::error::Error;
use crate::init;
use crate::session::UsbSession;
use crate::types::{DeviceInfo, DeviceMode, UsbEndpoints};

/// libusb treats a zero timeout as unlimited
fn bounded(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

/// ### USB Transfer
///
/// Bulk and control endpoints of one claimed interface.
///
pub trait UsbTransfer: Interface {
    /// Number of the claimed interface, used as wIndex of class requests
    fn interface_number(&self) -> u8;

    fn bulk_out_address(&self) -> u8;

    fn bulk_in_address(&self) -> u8;

    /// Max packet size of the BULK IN endpoint
    fn max_packet_size(&self) -> usize;

    /// Write all of `data` to the BULK OUT endpoint
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;

    /// One BULK IN transfer into `buf`
    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Clear a halt condition on both bulk endpoints
    fn clear_halts(&mut self) -> Result<()>;
}

/// ### USB Target
///
/// Which device to open.
///
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UsbTarget {
    /// First attached USBTMC device
    #[default]
    Any,
    /// By USB identifiers, optionally narrowed down by serial number
    Id {
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
    },
    /// By bus number and device address
    Address { bus: u8, device: u8 },
}

/// ### USB Config
///
/// Device selection and interface/endpoint overrides.
///
#[derive(Debug, Clone)]
pub struct UsbConfig {
    pub target: UsbTarget,
    /// Interface to claim, the first USBTMC interface if unset
    pub interface_number: Option<u8>,
    /// Alternate setting of the interface
    pub alt_setting: Option<u8>,
    /// BULK OUT endpoint address, taken from the descriptors if unset
    pub endpoint_out: Option<u8>,
    /// BULK IN endpoint address, taken from the descriptors if unset
    pub endpoint_in: Option<u8>,
    pub timeout: Duration,
}

impl UsbConfig {
    pub fn new(target: UsbTarget) -> Self {
        Self {
            target,
            interface_number: None,
            alt_setting: None,
            endpoint_out: None,
            endpoint_in: None,
            timeout: DEFAULT_TIMEOUT_DURATION,
        }
    }

    pub fn with_ids(vendor_id: u16, product_id: u16) -> Self {
        Self::new(UsbTarget::Id {
            vendor_id,
            product_id,
            serial_number: None,
        })
    }

    pub fn with_interface(mut self, interface_number: u8, alt_setting: Option<u8>) -> Self {
        self.interface_number = Some(interface_number);
        self.alt_setting = alt_setting;
        self
    }

    pub fn with_endpoints(mut self, endpoint_out: u8, endpoint_in: u8) -> Self {
        self.endpoint_out = Some(endpoint_out);
        self.endpoint_in = Some(endpoint_in);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self::new(UsbTarget::Any)
    }
}

struct Claimed {
    handle: DeviceHandle<Context>,
    mode: DeviceMode,
    endpoints: UsbEndpoints,
    device: DeviceInfo,
}

/// ### USB Interface
///
/// A claimed interface of an opened USB device.
///
pub struct UsbInterface {
    config: UsbConfig,
    claimed: Option<Claimed>,
    // dropped after the handle
    session: Option<UsbSession>,
    inbound: InboundBuffer,
}

impl UsbInterface {
    /// ### TMC devices
    ///
    /// Get a list of attached USBTMC devices.
    ///
    pub fn devices() -> Result<Vec<DeviceInfo>> {
        let session = UsbSession::acquire()?;
        init::list_devices(session.context())
    }

    /// ### Open
    ///
    /// Open the device described by `config` and claim its interface.
    ///
    pub fn open(config: UsbConfig) -> Result<UsbInterface> {
        let mut interface = UsbInterface {
            config,
            claimed: None,
            session: None,
            inbound: InboundBuffer::new(),
        };
        Interface::open(&mut interface)?;
        Ok(interface)
    }

    pub fn config(&self) -> &UsbConfig {
        &self.config
    }

    /// Mode of the claimed interface
    pub fn mode(&self) -> Option<&DeviceMode> {
        self.claimed.as_ref().map(|claimed| &claimed.mode)
    }

    pub fn endpoints(&self) -> Option<&UsbEndpoints> {
        self.claimed.as_ref().map(|claimed| &claimed.endpoints)
    }

    /// Identifiers and bus location of the opened device
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.claimed.as_ref().map(|claimed| claimed.device)
    }

    fn claimed(&self) -> Result<&Claimed> {
        self.claimed
            .as_ref()
            .ok_or_else(|| Error::not_connected(&self.info()).into())
    }

    fn claim(&self, session: &UsbSession) -> Result<Claimed> {
        let (device, mut handle, info) = init::open_device(session.context(), &self.config.target)?;
        let mut mode = init::get_device_mode(&device, self.config.interface_number, self.config.alt_setting)?;
        init::detach_kernel_driver(&mut mode, &mut handle)?;

        // changing the configuration of a configured device resets it
        match handle.active_configuration() {
            Ok(active) if active == mode.config_number => {}
            _ => handle.set_active_configuration(mode.config_number)?,
        }
        handle.claim_interface(mode.interface_number)?;
        if mode.setting_number != 0 {
            handle.set_alternate_setting(mode.interface_number, mode.setting_number)?;
        }

        let endpoints =
            init::get_endpoints(&mode, &device, self.config.endpoint_out, self.config.endpoint_in)?;
        debug!(
            config = mode.config_number,
            interface = mode.interface_number,
            setting = mode.setting_number,
            bulk_out = endpoints.bulk_out_ep.address,
            bulk_in = endpoints.bulk_in_ep.address,
            "interface claimed"
        );

        Ok(Claimed {
            handle,
            mode,
            endpoints,
            device: info,
        })
    }
}

impl Interface for UsbInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Usb
    }

    fn open(&mut self) -> Result<()> {
        if self.claimed.is_some() {
            return Ok(());
        }
        let session = UsbSession::acquire()?;
        let claimed = self.claim(&session)?;
        info!(
            vendor_id = claimed.device.id.vendor_id,
            product_id = claimed.device.id.product_id,
            bus = claimed.device.address.bus,
            address = claimed.device.address.device,
            "usb device opened"
        );

        self.claimed = Some(claimed);
        self.session = Some(session);
        self.inbound.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let info = self.info();
        if let Some(claimed) = self.claimed.take() {
            let interface = claimed.mode.interface_number;
            if let Err(err) = claimed.handle.release_interface(interface) {
                warn!(interface, %err, "failed to release interface");
            }
            if claimed.mode.has_kernel_driver {
                if let Err(err) = claimed.handle.attach_kernel_driver(interface) {
                    warn!(interface, %err, "failed to reattach kernel driver");
                }
            }
            info!(%info, "usb device closed");
        }
        self.session = None;
        Ok(())
    }

    fn good(&self) -> bool {
        self.claimed.is_some()
    }

    fn info(&self) -> String {
        if let Some(claimed) = &self.claimed {
            return format!(
                "usb;0x{:04X}:0x{:04X}",
                claimed.device.id.vendor_id, claimed.device.id.product_id
            );
        }
        match &self.config.target {
            UsbTarget::Any => "usb;any".to_string(),
            UsbTarget::Id {
                vendor_id,
                product_id,
                ..
            } => format!("usb;0x{vendor_id:04X}:0x{product_id:04X}"),
            UsbTarget::Address { bus, device } => format!("usb;{bus:03}:{device:03}"),
        }
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<usize> {
        let timeout = self.config.timeout;
        self.write_bulk(data, timeout)
    }

    fn read_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_bulk(buf, timeout)
    }

    fn inbound(&mut self) -> &mut InboundBuffer {
        &mut self.inbound
    }
}

impl UsbTransfer for UsbInterface {
    fn interface_number(&self) -> u8 {
        self.mode().map_or(0, |mode| mode.interface_number)
    }

    fn bulk_out_address(&self) -> u8 {
        self.endpoints().map_or(0, |ep| ep.bulk_out_ep.address)
    }

    fn bulk_in_address(&self) -> u8 {
        self.endpoints().map_or(0, |ep| ep.bulk_in_ep.address)
    }

    fn max_packet_size(&self) -> usize {
        self.endpoints()
            .map_or(64, |ep| ep.bulk_in_ep.max_packet_size as usize)
    }

    /// ### Write Bulk
    ///
    /// Split `data` into max packet size chunks and resend whatever part of a chunk
    /// the device did not take.
    ///
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let claimed = self.claimed()?;
        let timeout = bounded(timeout);
        let endpoint = &claimed.endpoints.bulk_out_ep;
        let packet_size = (endpoint.max_packet_size as usize).max(1);

        let mut written = 0;
        while written < data.len() {
            let end = (written + packet_size).min(data.len());
            let n = claimed
                .handle
                .write_bulk(endpoint.address, &data[written..end], timeout)
                .map_err(Error::from)?;
            if n == 0 {
                return Err(Error::Io {
                    message: format!("bulk out stalled after {written} of {} bytes", data.len()),
                    code: None,
                }
                .into());
            }
            written += n;
        }
        Ok(written)
    }

    fn read_bulk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let claimed = self.claimed()?;
        let n = claimed
            .handle
            .read_bulk(claimed.endpoints.bulk_in_ep.address, buf, bounded(timeout))
            .map_err(Error::from)?;
        Ok(n)
    }

    fn read_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let claimed = self.claimed()?;
        let n = claimed
            .handle
            .read_control(request_type, request, value, index, buf, bounded(timeout))
            .map_err(Error::from)?;
        Ok(n)
    }

    fn write_control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let claimed = self.claimed()?;
        let n = claimed
            .handle
            .write_control(request_type, request, value, index, data, bounded(timeout))
            .map_err(Error::from)?;
        Ok(n)
    }

    fn clear_halts(&mut self) -> Result<()> {
        let claimed = self.claimed()?;
        claimed.handle.clear_halt(claimed.endpoints.bulk_out_ep.address)?;
        claimed.handle.clear_halt(claimed.endpoints.bulk_in_ep.address)?;
        Ok(())
    }
}

impl Drop for UsbInterface {
    fn drop(&mut self) {
        let _ = Interface::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorExt, ErrorKind};

    fn closed(config: UsbConfig) -> UsbInterface {
        UsbInterface {
            config,
            claimed: None,
            session: None,
            inbound: InboundBuffer::new(),
        }
    }

    #[test]
    fn test_info_before_open() {
        assert_eq!(closed(UsbConfig::with_ids(0x1AB1, 0x04CE)).info(), "usb;0x1AB1:0x04CE");
        assert_eq!(closed(UsbConfig::default()).info(), "usb;any");
        let by_address = UsbConfig::new(UsbTarget::Address { bus: 1, device: 12 });
        assert_eq!(closed(by_address).info(), "usb;001:012");
    }

    #[test]
    fn test_closed_interface_fails_fast() {
        let mut usb = closed(UsbConfig::with_ids(0x1AB1, 0x04CE).with_timeout(Duration::from_secs(5)));
        assert!(!usb.good());

        let err = usb.write("*IDN?\n").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Connection));

        let mut buf = [0u8; 8];
        let err = usb.read_bulk(&mut buf, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Connection));

        // closing twice is fine
        usb.close().unwrap();
        usb.close().unwrap();
    }

    #[test]
    fn test_config_builders() {
        let config = UsbConfig::with_ids(0x0957, 0x1796)
            .with_interface(1, Some(2))
            .with_endpoints(0x02, 0x86);
        assert_eq!(config.interface_number, Some(1));
        assert_eq!(config.alt_setting, Some(2));
        assert_eq!(config.endpoint_out, Some(0x02));
        assert_eq!(config.endpoint_in, Some(0x86));
        assert_eq!(config.timeout, DEFAULT_TIMEOUT_DURATION);
    }
}
