//! End to end scenarios on the public API, driven through the mock interfaces.
//!
//! Run with: cargo test --test end_to_end

use std::time::Duration;

use anyhow::Result;
use rs_labdev::device::{check_channel, split_response, DeviceLink};
use rs_labdev::interface::{Interface, MockInterface, MockUsbTransfer, UsbtmcInterface};
use rs_labdev::scpi::Scpi;
use rs_labdev::{ErrorExt, ErrorKind};

const TIMEOUT: Duration = Duration::from_millis(200);

/// Minimal power supply driver written the way downstream drivers use the crate
struct PowerSupply<I: Interface> {
    link: DeviceLink<I>,
    channels: u32,
}

impl<I: Interface> PowerSupply<I> {
    fn new(channels: u32) -> Self {
        Self {
            link: DeviceLink::new("psu"),
            channels,
        }
    }

    fn set_voltage(&mut self, channel: u32, volt: f64) -> Result<()> {
        check_channel(channel, self.channels)?;
        self.link.comm_mut()?.write(&format!("INST:NSEL {channel};:VOLT {volt:.3}\n"))
    }

    fn voltage(&mut self, channel: u32) -> Result<f64> {
        check_channel(channel, self.channels)?;
        let comm = self.link.comm_mut()?;
        comm.write(&format!("INST:NSEL {channel};:MEAS:VOLT?\n"))?;
        let reply = comm.read_until("\n", TIMEOUT)?;
        Ok(reply.trim().parse()?)
    }
}

#[test]
fn test_serial_style_exchange() {
    // 9600 8N1 instrument answering VOLT? with 5.000
    let mut comm = MockInterface::new();
    comm.respond_to("VOLT?\n", "5.000\n");

    comm.write("VOLT 5.0\n").unwrap();
    let reply = comm.query("VOLT?\n", TIMEOUT).unwrap();

    assert_eq!(reply, "5.000\n");
    assert_eq!(comm.written_strings(), vec!["VOLT 5.0\n", "VOLT?\n"]);
}

#[test]
fn test_driver_on_device_link() {
    let mock = MockInterface::new();
    mock.respond_to("INST:NSEL 2;:MEAS:VOLT?\n", "+1.20000E+01\n");

    let mut psu = PowerSupply::new(2);
    assert_eq!(
        psu.set_voltage(1, 1.0).unwrap_err().kind(),
        Some(ErrorKind::Connection)
    );

    psu.link.bind(mock.clone()).unwrap();
    psu.set_voltage(1, 3.3).unwrap();
    assert_eq!(psu.voltage(2).unwrap(), 12.0);
    assert_eq!(
        psu.set_voltage(3, 1.0).unwrap_err().kind(),
        Some(ErrorKind::Configuration)
    );

    assert_eq!(mock.written_strings()[0], "INST:NSEL 1;:VOLT 3.300\n");
    assert_eq!(psu.link.info(), "psu;mock");
}

#[test]
fn test_scpi_identification_and_errors() {
    let mock = MockInterface::new();
    mock.respond_to("*IDN?\n", "ACME,PSU-2000,SN0042,2.1.0\r\n");
    mock.respond_to("SYST:ERR?\n", "-222,\"Data out of range\"\n");

    let mut scpi = Scpi::new(mock.clone());
    let idn = scpi.get_identifier().unwrap();
    let fields = split_response(&idn, ",", 4);
    assert_eq!(fields, vec!["ACME", "PSU-2000", "SN0042", "2.1.0"]);

    mock.clear_writes();
    let err = scpi.check_error().unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Device));
    assert_eq!(scpi.last_error(), (-222, "Data out of range"));
    assert_eq!(mock.written_strings(), vec!["SYST:ERR?\n"]);
}

#[test]
fn test_usbtmc_query_through_scpi() {
    let usb = MockUsbTransfer::new();
    // first request goes out with bTag 1
    usb.queue_dev_dep_msg(1, b"1\n", true);

    let tmc = UsbtmcInterface::from_transfer(usb.clone());
    let mut scpi = Scpi::new(tmc);
    assert!(scpi.operation_complete(TIMEOUT).unwrap());

    let out = usb.bulk_out();
    // DEV_DEP_MSG_OUT carrying *OPC?, then REQUEST_DEV_DEP_MSG_IN
    assert_eq!(out.len(), 2);
    assert_eq!(out[0][0], 1);
    assert_eq!(&out[0][12..18], b"*OPC?\n");
    assert_eq!(out[1][0], 2);
    assert_eq!(scpi.interface().btag(), 2);
}

#[test]
fn test_lost_connection() {
    let mock = MockInterface::new();
    let mut link = DeviceLink::new("dmm");
    link.bind(mock.clone()).unwrap();

    mock.disconnect();
    assert!(!link.connected());
    let err = link.comm_mut().unwrap().write("*RST\n").unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Connection));
    assert!(!err.is_timeout());
}
