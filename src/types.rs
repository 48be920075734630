//! ## Types
//!
//! The different types used across the crate
//!

use rusb::{Direction, TransferType};

/// ### bTag
///
/// The bTag element used to match a USBTMC request with its response.
///
/// Starts at 1. It is only advanced once a complete response has been read, so
/// several writes without a read in between share the same value. Wraps around
/// on unsigned overflow.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTag(u8);

impl BTag {
    /// ### New
    ///
    /// Return a fresh bTag set at the value 1.
    ///
    pub fn new() -> BTag {
        BTag(1)
    }

    pub fn current(&self) -> u8 {
        self.0
    }

    /// The inverted value sent next to the tag in every header
    pub fn inverse(&self) -> u8 {
        !self.0
    }

    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

impl Default for BTag {
    fn default() -> Self {
        Self::new()
    }
}

/// ### Control bTag
///
/// Tag used by the USB488 READ_STATUS_BYTE control request. Valid values are 2 to 127.
///
#[derive(Debug, Clone, Copy)]
pub struct CtlBTag(u8);

impl CtlBTag {
    pub fn new() -> CtlBTag {
        CtlBTag(2)
    }

    /// Return the current value and move on to the next one
    pub fn next(&mut self) -> u8 {
        let tag = self.0;
        self.0 = if tag >= 127 { 2 } else { tag + 1 };
        tag
    }
}

impl Default for CtlBTag {
    fn default() -> Self {
        Self::new()
    }
}

/// ### Device Mode
///
/// A collection of the configuration, interface and interface number. Also if the interface has a kernel driver attached.
///
#[derive(Debug, Clone, Default)]
pub struct DeviceMode {
    /// The USB configuration number
    pub config_number: u8,
    /// The interface number specific to the configuration
    pub interface_number: u8,
    /// The setting number specific to the interface
    pub setting_number: u8,
    /// Class code of the interface, used to check for USBTMC
    pub class_code: u8,
    /// Subclass code of the interface
    pub sub_class_code: u8,
    /// If the device has a kernel driver. Important for returning control to the OS (on Linux).
    pub has_kernel_driver: bool,
}

/// ### Endpoint
///
/// Properties of an endpoint.
///
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// Address of the endpoint on the interface
    pub address: u8,
    /// The maximal size a packet can have on this endpoint
    pub max_packet_size: u16,
    /// The transfer type of the endpoint
    pub transfer_type: TransferType,
    /// The direction of the endpoint
    pub direction: Direction,
}

/// ### USB Endpoints
///
/// Endpoints resolved for the claimed interface.
///
#[derive(Clone, Debug)]
pub struct UsbEndpoints {
    /// The mandatory BULK OUT endpoint
    pub bulk_out_ep: Endpoint,
    /// The mandatory BULK IN endpoint
    pub bulk_in_ep: Endpoint,
    /// The optional INTERRUPT IN endpoint
    pub interrupt_ep: Option<Endpoint>,
}

/// ### Capabilities
///
/// The collected capabilities of a USBTMC device.
///
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub bcd_version: u16,
    /// Can accept a control command for pulse
    pub accepts_indicator_pulse_request: bool,
    /// Only sends data to the controller
    pub is_talk_only: bool,
    /// Only accepts data from the controller
    pub is_listen_only: bool,
    /// When returning data, it has a terminator character in the data
    pub supports_bulk_in_term_char: bool,
}

/// USB identifiers of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// USB bus location of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr {
    pub bus: u8,
    pub device: u8,
}

/// Identifiers and location of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub address: DeviceAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btag_wraps() {
        let mut btag = BTag::new();
        assert_eq!(btag.current(), 1);
        assert_eq!(btag.inverse(), 0xFE);

        for _ in 0..255 {
            btag.advance();
        }
        assert_eq!(btag.current(), 0);
        btag.advance();
        assert_eq!(btag.current(), 1);
    }

    #[test]
    fn test_ctl_btag_range() {
        let mut tag = CtlBTag::new();
        let values: Vec<u8> = (0..130).map(|_| tag.next()).collect();
        assert_eq!(values[0], 2);
        assert_eq!(values[125], 127);
        assert_eq!(values[126], 2);
        assert!(values.iter().all(|v| (2..=127).contains(v)));
    }
}
