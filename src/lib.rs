//! # Rust Lab Device
//!
//! Transport and protocol core for laboratory instruments.
//!
//! One [`Interface`](interface::Interface) trait covers every way of reaching an
//! instrument: serial ports, serial lines behind an Ethernet bridge, raw TCP
//! sockets, USB bulk endpoints, USBTMC and (with the `visa` feature) an installed
//! VISA library. Framed reads, delimiter handling and queries behave the same on
//! all of them. The [`scpi`] module adds the IEEE 488.2 common commands on top,
//! [`modbus`] a Modbus TCP client, and [`device`] the binding pattern instrument
//! drivers are built on.
//!
//! The USBTMC implementation is pure Rust on top of libusb: DEVICE_DEPENDENT and
//! VENDOR_SPECIFIC bulk messages, the USBTMC control requests (capabilities,
//! clear, abort, indicator pulse) and the USB488 READ_STATUS_BYTE request.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rs_labdev::interface::{Interface, SerialConfig, SerialInterface};
//! use rs_labdev::scpi::Scpi;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut comm = SerialInterface::open(SerialConfig::new("/dev/ttyUSB0", 9600))?;
//!
//!     comm.write("VOLT 5.0\n")?;
//!     let volt = comm.query("VOLT?\n", Duration::from_secs(1))?;
//!     println!("{}", volt.trim());
//!
//!     let mut scpi = Scpi::new(comm);
//!     println!("{}", scpi.get_identifier()?);
//!     scpi.check_error()?;
//!     Ok(())
//! }
//! ```
//!
//! USBTMC instruments are opened by USB identifiers:
//!
//! ```no_run
//! use rs_labdev::interface::{Interface, UsbConfig, UsbInterface, UsbtmcInterface};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = UsbConfig::with_ids(0x1AB1, 0x04CE);
//! let mut scope = UsbtmcInterface::<UsbInterface>::open(config)?;
//! let idn = scope.query("*IDN?\n", scope.timeout())?;
//! # Ok(())
//! # }
//! ```
//!

mod constants;
pub mod device;
pub mod error;
mod init;
pub mod interface;
pub mod modbus;
pub mod scpi;
pub mod session;
pub mod types;
mod communication {
    pub mod bulk;
    pub mod control;
}

use rusb::DeviceDescriptor;

pub use communication::bulk::{framed_len, UsbtmcHeader};
pub use constants::transfer_attr;
pub use error::{Error, ErrorExt, ErrorKind};
pub use init::is_tmc_interface;
pub use interface::{open_interface, Interface, InterfaceConfig, InterfaceKind};
pub use types::{Capabilities, DeviceAddr, DeviceId, DeviceInfo};

/// ### Device Filter
///
/// Selects the USB device to open.
///
/// - `()`: first USBTMC device found
/// - [`DeviceId`]: device by USB identifiers
/// - [`DeviceAddr`]: device by bus and device number
/// - [`DeviceInfo`]: both of the above
/// - [`UsbTarget`](interface::UsbTarget): any of the above, optionally with a serial number
///
pub trait DeviceFilter {
    fn apply_filter<T: rusb::UsbContext>(
        &self,
        device: &rusb::Device<T>,
        device_desc: &DeviceDescriptor,
    ) -> bool;

    /// Serial number the device must report, checked once the device is open
    fn serial_number(&self) -> Option<&str> {
        None
    }
}
