//! ## Constants
//!
//! Various constants used throughout the project.
//!

#[allow(unused)]
pub mod usb {
    /// The class code for usbtmc
    pub const USBTMC_CLASS_CODE: u8 = 0xFE;
    /// The subclass code for usbtmc
    pub const USBTMC_SUBCLASS_CODE: u8 = 0x03;
    /// The protocol code for the USB488 spec of usbtmc
    pub const USBTMC_PROTOCOL_CODE: u8 = 0x01;
}

pub mod misc {
    use std::time::Duration;

    /// The default timeout duration
    pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(2);
    /// Default size of a single read, 1 MiB
    pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;
    /// The size in bytes of a USBTMC header in a bulk transfer
    pub const USBTMC_HEADER_SIZE: usize = 12;
    /// Default termination character to use (using NI-VISA default '\n')
    pub const DEFAULT_TERM_CHAR: u8 = b'\n';
    /// Interval between CHECK_*_STATUS control requests while the device is busy
    pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(5);
}

#[allow(unused)]
pub mod usbtmc_status {
    /// Success
    pub const STATUS_SUCCESS: u8 = 0x01;
    /// The device has received a split transaction CHECK_STATUS request and the request is being processed
    pub const STATUS_PENDING: u8 = 0x02;
    /// Failure for unspecified or undefined reason
    pub const STATUS_FAILED: u8 = 0x80;
    /// The device received an INITIATE_ABORT request, but the request is not in progress
    pub const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;
    /// The device got a CHECK_STATUS request without any INITIATE request being processed
    pub const STATUS_SPLIT_NOT_IN_PROGRESS: u8 = 0x82;
    /// The device got an INIATE request, but another one is already being processed
    pub const STATUS_SPLIT_IN_PROGRESS: u8 = 0x83;
}

#[allow(unused)]
pub mod control_requests {
    pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
    pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
    pub const INITIATE_ABORT_BULK_IN: u8 = 3;
    pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
    pub const INITIATE_CLEAR: u8 = 5;
    pub const CHECK_CLEAR_STATUS: u8 = 6;
    pub const GET_CAPABILITIES: u8 = 7;
    pub const INDICATOR_PULSE: u8 = 64;
    pub const READ_STATUS_BYTE: u8 = 128;
}

pub mod bulk_msg_id {
    pub const DEV_DEP_MSG_OUT: u8 = 1;
    pub const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
    pub const DEV_DEP_MSG_IN: u8 = 2;
    pub const VENDOR_SPECIFIC_OUT: u8 = 126;
    pub const REQUEST_VENDOR_SPECIFIC_IN: u8 = 127;
    pub const VENDOR_SPECIFIC_IN: u8 = 127;
}

/// bmTransferAttributes flags
pub mod transfer_attr {
    /// Last transfer of a message
    pub const EOM: u8 = 0x01;
    /// Device must end the transfer on the terminating character
    pub const TERM_CHAR: u8 = 0x02;
}

/// Standard Event Status Register bits
pub mod esr {
    /// Operation Complete
    pub const OPC: u8 = 1 << 0;
    /// Request Control
    pub const RQC: u8 = 1 << 1;
    /// Query Error
    pub const QYE: u8 = 1 << 2;
    /// Device Dependent Error
    pub const DDE: u8 = 1 << 3;
    /// Execution Error
    pub const EXE: u8 = 1 << 4;
    /// Command Error
    pub const CME: u8 = 1 << 5;
    /// User Request
    pub const URQ: u8 = 1 << 6;
    /// Power On
    pub const PON: u8 = 1 << 7;
}

pub mod scpi {
    use std::time::Duration;

    /// Default deadline for `*OPC?` and the `*OPC`/`*ESR?` poll
    pub const DEFAULT_OPC_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default timeout for a single `*ESR?` query
    pub const DEFAULT_ESR_TIMEOUT: Duration = Duration::from_secs(1);
    /// Default sleep between two `*ESR?` polls
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
}

pub mod serial {
    /// Baud rates accepted by the serial interface
    pub const SUPPORTED_BAUD_RATES: [u32; 21] = [
        0, 50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400,
        57600, 115200, 230400, 460800, 921600,
    ];
}

pub mod eth_to_ser {
    use std::time::Duration;

    /// Port of the configuration web server of the bridge
    pub const HTTP_PORT: u16 = 80;
    /// Form target that stores the serial settings
    pub const SETTINGS_PATH: &str = "/ok.html";
    /// Time the bridge needs to restart its TCP server after a settings change
    pub const RESTART_DELAY: Duration = Duration::from_millis(100);
    /// Baud rates the bridge offers and their form codes
    pub const BAUD_CODES: [(u32, &str); 12] = [
        (1200, "0"),
        (2400, "1"),
        (4800, "2"),
        (7200, "3"),
        (9600, "4"),
        (14400, "5"),
        (19200, "6"),
        (28800, "7"),
        (38400, "8"),
        (57600, "9"),
        (76800, "A"),
        (115200, "B"),
    ];
}

pub mod modbus {
    /// Transaction id, protocol id and length in front of every Modbus TCP frame
    pub const MBAP_HEADER_SIZE: usize = 6;
    /// Largest value of the MBAP length field (unit id plus PDU)
    pub const MAX_MBAP_LENGTH: usize = 254;
    /// Set on the function code of an exception response
    pub const EXCEPTION_FLAG: u8 = 0x80;
    pub const MAX_READ_REGISTERS: u16 = 125;
    pub const MAX_WRITE_REGISTERS: u16 = 123;
    pub const MAX_READ_BITS: u16 = 2000;
    pub const MAX_WRITE_BITS: u16 = 1968;
}
