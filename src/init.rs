//! ## Initialization
//!
//! A set of functions to help initialize a connection to a USB device.
//!

use crate::{
    constants::usb::*,
    error::Error,
    interface::UsbTarget,
    types::{DeviceAddr, DeviceId, DeviceInfo, DeviceMode, Endpoint, UsbEndpoints},
    DeviceFilter,
};

use anyhow::Result;
use rusb::{
    Device, DeviceDescriptor, DeviceHandle, Direction, InterfaceDescriptor, TransferType,
    UsbContext,
};
use tracing::{debug, warn};

/// Get first found TMC device
impl DeviceFilter for () {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        is_tmc_device(device, device_desc)
    }
}

/// Get device by USB device address
impl DeviceFilter for DeviceAddr {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, _device_desc: &DeviceDescriptor) -> bool {
        self.bus == device.bus_number() && self.device == device.address()
    }
}

/// Get device by USB identifiers
impl DeviceFilter for DeviceId {
    fn apply_filter<T: UsbContext>(&self, _device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        self.vendor_id == device_desc.vendor_id() && self.product_id == device_desc.product_id()
    }
}

/// Get device by info (both USB identifiers and address)
impl DeviceFilter for DeviceInfo {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        self.id.apply_filter(device, device_desc) && self.address.apply_filter(device, device_desc)
    }
}

impl DeviceFilter for UsbTarget {
    fn apply_filter<T: UsbContext>(&self, device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
        match self {
            UsbTarget::Any => ().apply_filter(device, device_desc),
            UsbTarget::Id {
                vendor_id,
                product_id,
                ..
            } => DeviceId {
                vendor_id: *vendor_id,
                product_id: *product_id,
            }
            .apply_filter(device, device_desc),
            UsbTarget::Address { bus, device: addr } => DeviceAddr {
                bus: *bus,
                device: *addr,
            }
            .apply_filter(device, device_desc),
        }
    }

    fn serial_number(&self) -> Option<&str> {
        match self {
            UsbTarget::Id { serial_number, .. } => serial_number.as_deref(),
            _ => None,
        }
    }
}

/// Allow apply filter by reference
impl<T: DeviceFilter> DeviceFilter for &T {
    fn apply_filter<X: UsbContext>(&self, device: &Device<X>, device_desc: &DeviceDescriptor) -> bool {
        (**self).apply_filter(device, device_desc)
    }

    fn serial_number(&self) -> Option<&str> {
        (**self).serial_number()
    }
}

/// True for the USBTMC class/subclass, both plain USBTMC and USB488
pub fn is_tmc_interface(interface_desc: &InterfaceDescriptor) -> bool {
    interface_desc.class_code() == USBTMC_CLASS_CODE
        && interface_desc.sub_class_code() == USBTMC_SUBCLASS_CODE
}

fn is_tmc_device<T: UsbContext>(device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
    (0..device_desc.num_configurations()).any(|config_no| match device.config_descriptor(config_no) {
        Ok(config_desc) => config_desc
            .interfaces()
            .any(|interface| interface.descriptors().any(|desc| is_tmc_interface(&desc))),
        Err(_) => false,
    })
}

/// ### List Devices
///
/// List all TMC devices using a libusb context.
///
pub fn list_devices<T: UsbContext>(context: &T) -> Result<Vec<DeviceInfo>> {
    Ok(context
        .devices()?
        .iter()
        .filter_map(|device| {
            let device_desc = device.device_descriptor().ok()?;
            is_tmc_device(&device, &device_desc).then(|| DeviceInfo {
                id: DeviceId {
                    vendor_id: device_desc.vendor_id(),
                    product_id: device_desc.product_id(),
                },
                address: DeviceAddr {
                    bus: device.bus_number(),
                    device: device.address(),
                },
            })
        })
        .collect())
}

/// ### Open Device
///
/// Open the first device matching `filter`, including its serial number if the
/// filter asks for one.
///
pub fn open_device<T: UsbContext>(
    context: &T,
    filter: impl DeviceFilter,
) -> Result<(Device<T>, DeviceHandle<T>, DeviceInfo)> {
    for device in context.devices()?.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if !filter.apply_filter(&device, &device_desc) {
            continue;
        }

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(bus = device.bus_number(), address = device.address(), %err, "cannot open matching device");
                continue;
            }
        };

        if let Some(wanted) = filter.serial_number() {
            match handle.read_serial_number_string_ascii(&device_desc) {
                Ok(serial) if serial == wanted => {}
                _ => continue,
            }
        }

        let info = DeviceInfo {
            id: DeviceId {
                vendor_id: device_desc.vendor_id(),
                product_id: device_desc.product_id(),
            },
            address: DeviceAddr {
                bus: device.bus_number(),
                device: device.address(),
            },
        };
        return Ok((device, handle, info));
    }

    Err(Error::DeviceNotFound.into())
}

/// ### Get Device Mode
///
/// Find the configuration, interface and setting to claim.
///
/// With an explicit `interface_number` that interface is used (setting 0 unless
/// `setting_number` says otherwise). Without one, the first USBTMC interface wins.
///
pub fn get_device_mode<T: UsbContext>(
    device: &Device<T>,
    interface_number: Option<u8>,
    setting_number: Option<u8>,
) -> Result<DeviceMode> {
    let device_desc = device.device_descriptor()?;

    for n in 0..device_desc.num_configurations() {
        let config_desc = device.config_descriptor(n)?;
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                let wanted = match interface_number {
                    Some(number) => {
                        interface_desc.interface_number() == number
                            && interface_desc.setting_number() == setting_number.unwrap_or(0)
                    }
                    None => {
                        is_tmc_interface(&interface_desc)
                            && setting_number.map_or(true, |s| interface_desc.setting_number() == s)
                    }
                };
                if wanted {
                    return Ok(DeviceMode {
                        config_number: config_desc.number(),
                        interface_number: interface_desc.interface_number(),
                        setting_number: interface_desc.setting_number(),
                        class_code: interface_desc.class_code(),
                        sub_class_code: interface_desc.sub_class_code(),
                        has_kernel_driver: false,
                    });
                }
            }
        }
    }

    match interface_number {
        Some(_) if setting_number.is_some() => Err(Error::InterfaceSettingNotFound.into()),
        Some(_) => Err(Error::InterfaceNotFound.into()),
        None => Err(Error::DeviceIncompatible.into()),
    }
}

/// ### Detach Kernel Driver
///
/// If the interface uses a kernel driver, detach it while the interface is claimed.
///
pub fn detach_kernel_driver<T: UsbContext>(mode: &mut DeviceMode, handle: &mut DeviceHandle<T>) -> Result<()> {
    mode.has_kernel_driver = match handle.kernel_driver_active(mode.interface_number) {
        Ok(true) => {
            handle.detach_kernel_driver(mode.interface_number)?;
            debug!(interface = mode.interface_number, "kernel driver detached");
            true
        }
        _ => false,
    };

    Ok(())
}

fn select_endpoint(
    endpoints: &[Endpoint],
    address: Option<u8>,
    transfer_type: TransferType,
    direction: Direction,
) -> Result<Option<Endpoint>> {
    match address {
        Some(address) => match endpoints.iter().find(|ep| ep.address == address) {
            Some(ep) if ep.transfer_type == transfer_type && ep.direction == direction => Ok(Some(ep.clone())),
            _ => Err(Error::IncorrectEndpoint.into()),
        },
        None => Ok(endpoints
            .iter()
            .find(|ep| ep.transfer_type == transfer_type && ep.direction == direction)
            .cloned()),
    }
}

/// ### Get Endpoints
///
/// Resolve the endpoints of the claimed interface setting.
///
/// Explicit addresses in `bulk_out`/`bulk_in` override the descriptor scan but
/// must still name a bulk endpoint of the right direction.
///
pub fn get_endpoints<T: UsbContext>(
    mode: &DeviceMode,
    device: &Device<T>,
    bulk_out: Option<u8>,
    bulk_in: Option<u8>,
) -> Result<UsbEndpoints> {
    let device_desc = device.device_descriptor()?;
    let config_desc = (0..device_desc.num_configurations())
        .filter_map(|n| device.config_descriptor(n).ok())
        .find(|desc| desc.number() == mode.config_number)
        .ok_or(Error::InterfaceNotFound)?;

    let interface = config_desc
        .interfaces()
        .find(|inter| inter.number() == mode.interface_number)
        .ok_or(Error::InterfaceNotFound)?;
    let interface_desc = interface
        .descriptors()
        .find(|d| d.setting_number() == mode.setting_number)
        .ok_or(Error::InterfaceSettingNotFound)?;

    let endpoints: Vec<Endpoint> = interface_desc
        .endpoint_descriptors()
        .map(|endpoint| Endpoint {
            address: endpoint.address(),
            max_packet_size: endpoint.max_packet_size(),
            transfer_type: endpoint.transfer_type(),
            direction: endpoint.direction(),
        })
        .collect();

    let bulk_out_ep = select_endpoint(&endpoints, bulk_out, TransferType::Bulk, Direction::Out)?
        .ok_or(Error::BulkOutEndpointNotFound)?;
    let bulk_in_ep = select_endpoint(&endpoints, bulk_in, TransferType::Bulk, Direction::In)?
        .ok_or(Error::BulkInEndpointNotFound)?;
    let interrupt_ep = select_endpoint(&endpoints, None, TransferType::Interrupt, Direction::In)?;

    Ok(UsbEndpoints {
        bulk_out_ep,
        bulk_in_ep,
        interrupt_ep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: u8, transfer_type: TransferType, direction: Direction) -> Endpoint {
        Endpoint {
            address,
            max_packet_size: 512,
            transfer_type,
            direction,
        }
    }

    #[test]
    fn test_select_endpoint() {
        let endpoints = vec![
            endpoint(0x01, TransferType::Bulk, Direction::Out),
            endpoint(0x82, TransferType::Bulk, Direction::In),
            endpoint(0x83, TransferType::Interrupt, Direction::In),
            endpoint(0x04, TransferType::Bulk, Direction::Out),
        ];

        let out = select_endpoint(&endpoints, None, TransferType::Bulk, Direction::Out).unwrap();
        assert_eq!(out.unwrap().address, 0x01);

        let out = select_endpoint(&endpoints, Some(0x04), TransferType::Bulk, Direction::Out).unwrap();
        assert_eq!(out.unwrap().address, 0x04);

        // an interrupt endpoint cannot be used for bulk in
        assert!(select_endpoint(&endpoints, Some(0x83), TransferType::Bulk, Direction::In).is_err());
        assert!(select_endpoint(&endpoints, Some(0x05), TransferType::Bulk, Direction::Out).is_err());

        let none = select_endpoint(&endpoints[..2], None, TransferType::Interrupt, Direction::In).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_target_serial_number() {
        let target = UsbTarget::Id {
            vendor_id: 0x1AB1,
            product_id: 0x04CE,
            serial_number: Some("DS1ZA1234".to_string()),
        };
        assert_eq!(target.serial_number(), Some("DS1ZA1234"));
        assert_eq!((&target).serial_number(), Some("DS1ZA1234"));
        assert_eq!(UsbTarget::Any.serial_number(), None);
    }
}
