//! ## SCPI
//!
//! The IEEE 488.2 common commands and the error queue, on top of any [`Interface`].
//!
//! ```no_run
//! use rs_labdev::interface::{TcpIpConfig, TcpIpInterface};
//! use rs_labdev::scpi::Scpi;
//!
//! # fn main() -> anyhow::Result<()> {
//! let comm = TcpIpInterface::open(TcpIpConfig::new("192.168.1.20", 5025))?;
//! let mut scpi = Scpi::new(comm);
//! println!("{}", scpi.get_identifier()?);
//! scpi.reset()?;
//! scpi.check_error()?;
//! # Ok(())
//! # }
//! ```
//!

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, trace};

use crate::constants::esr;
use crate::constants::scpi::{DEFAULT_ESR_TIMEOUT, DEFAULT_OPC_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::error::Error;
use crate::interface::Interface;

pub use crate::constants::esr::{CME, DDE, EXE, OPC, PON, QYE, RQC, URQ};

/// ### SCPI
///
/// Standard command set of an instrument, owning the interface it talks through.
///
pub struct Scpi<I: Interface> {
    comm: I,
    error_code: i32,
    error_message: String,
    poll_interval: Duration,
}

impl<I: Interface> Scpi<I> {
    pub fn new(comm: I) -> Self {
        Self {
            comm,
            error_code: 0,
            error_message: "No error".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn interface(&self) -> &I {
        &self.comm
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.comm
    }

    /// Give the interface back
    pub fn into_inner(self) -> I {
        self.comm
    }

    /// Sleep between two `*ESR?` polls of [`Scpi::wait_to_complete`]
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn send(&mut self, command: &str) -> Result<()> {
        trace!(command, "scpi command");
        self.comm.write(&format!("{command}\n"))
    }

    /// Send a query and return the response line without its terminator
    fn query_line(&mut self, query: &str, timeout: Duration) -> Result<String> {
        self.send(query)?;
        let line = self.comm.read_until("\n", timeout)?;
        Ok(line.trim_end_matches('\r').to_string())
    }

    /// `*CLS`, clear the status registers and the error queue
    pub fn clear_status(&mut self) -> Result<()> {
        self.send("*CLS")
    }

    /// ### Get Identifier
    ///
    /// `*IDN?`, typically `<vendor>,<model>,<serial>,<firmware>`.
    ///
    pub fn get_identifier(&mut self) -> Result<String> {
        let timeout = self.comm.timeout();
        self.query_line("*IDN?", timeout)
    }

    /// `*RST`
    pub fn reset(&mut self) -> Result<()> {
        self.send("*RST")
    }

    /// `*TST?`, true if the self test passed
    pub fn test(&mut self) -> Result<bool> {
        let timeout = self.comm.timeout();
        Ok(self.query_line("*TST?", timeout)?.contains('0'))
    }

    /// `*OPC?`, true once all pending operations are done
    pub fn operation_complete(&mut self, timeout: Duration) -> Result<bool> {
        Ok(self.query_line("*OPC?", timeout)?.contains('1'))
    }

    /// ### Wait To Complete
    ///
    /// Send `*OPC` and poll the event status register until the operation complete
    /// bit is set.
    ///
    /// Fails with a timeout once more than `timeout` has passed since the first poll.
    ///
    pub fn wait_to_complete(&mut self, timeout: Duration) -> Result<()> {
        self.send("*OPC")?;

        let start = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            if self.get_event_status_register(timeout)? & esr::OPC != 0 {
                debug!(polls, elapsed = ?start.elapsed(), "operation complete");
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed > timeout {
                return Err(Error::Timeout(format!("*OPC not set after {polls} polls ({elapsed:?})")).into());
            }
            thread::sleep(self.poll_interval.min(timeout - elapsed));
        }
    }

    /// [`Scpi::wait_to_complete`] with the default deadline
    pub fn wait(&mut self) -> Result<()> {
        self.wait_to_complete(DEFAULT_OPC_TIMEOUT)
    }

    /// `*WAI`
    pub fn wait_to_continue(&mut self) -> Result<()> {
        self.send("*WAI")
    }

    /// ### Get Error
    ///
    /// Pop the oldest entry of the error queue with `SYST:ERR?`.
    ///
    /// The reply `-113,"Undefined header"` gives `(-113, "Undefined header")`. The
    /// result is kept until the next call, see [`Scpi::last_error`].
    ///
    pub fn get_error(&mut self) -> Result<(i32, String)> {
        let timeout = self.comm.timeout();
        let reply = self.query_line("SYST:ERR?", timeout)?;
        let (code, message) = parse_error(&reply)?;

        self.error_code = code;
        self.error_message = message.clone();
        Ok((code, message))
    }

    /// Result of the last [`Scpi::get_error`]
    pub fn last_error(&self) -> (i32, &str) {
        (self.error_code, &self.error_message)
    }

    /// ### Check Error
    ///
    /// Read the error queue and turn a non-zero entry into a device error.
    ///
    pub fn check_error(&mut self) -> Result<()> {
        match self.get_error()? {
            (0, _) => Ok(()),
            (code, message) => Err(Error::Device { code, message }.into()),
        }
    }

    /// ### Get Event Status Register
    ///
    /// `*ESR?`. The instrument clears the register on every read, the value is
    /// never cached.
    ///
    pub fn get_event_status_register(&mut self, timeout: Duration) -> Result<u8> {
        let reply = self.query_line("*ESR?", timeout)?;
        parse_register(&reply)
    }

    /// `*ESR?` with the default timeout
    pub fn event_status(&mut self) -> Result<u8> {
        self.get_event_status_register(DEFAULT_ESR_TIMEOUT)
    }
}

fn parse_error(reply: &str) -> Result<(i32, String)> {
    let (code, rest) = reply
        .split_once(',')
        .ok_or_else(|| Error::Protocol(format!("malformed error queue entry {reply:?}")))?;
    let code: i32 = code
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("malformed error code in {reply:?}")))?;

    let message = match (rest.find('"'), rest.rfind('"')) {
        (Some(first), Some(last)) if last > first => &rest[first + 1..last],
        _ => rest.trim(),
    };
    Ok((code, message.to_string()))
}

fn parse_register(reply: &str) -> Result<u8> {
    let text = reply.trim();
    let value = match text.parse::<i64>() {
        Ok(value) => value,
        // some instruments answer in NR3 notation
        Err(_) => match text.parse::<f64>() {
            Ok(value) if value.fract() == 0.0 => value as i64,
            _ => return Err(Error::Protocol(format!("malformed register value {reply:?}")).into()),
        },
    };
    u8::try_from(value).map_err(|_| Error::Protocol(format!("register value {value} out of range")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorExt, ErrorKind};
    use crate::interface::MockInterface;

    fn scpi() -> (Scpi<MockInterface>, MockInterface) {
        let mock = MockInterface::new();
        (Scpi::new(mock.clone()), mock)
    }

    #[test]
    fn test_get_error() {
        let (mut scpi, mock) = scpi();
        mock.respond_to("SYST:ERR?\n", "-113,\"Undefined header\"\n");

        assert_eq!(scpi.get_error().unwrap(), (-113, "Undefined header".to_string()));
        assert_eq!(scpi.last_error(), (-113, "Undefined header"));

        let err = scpi.check_error().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Device));
    }

    #[test]
    fn test_no_error() {
        let (mut scpi, mock) = scpi();
        mock.queue_str("+0,\"No error\"\r\n");
        scpi.check_error().unwrap();
        assert_eq!(scpi.last_error(), (0, "No error"));
    }

    #[test]
    fn test_malformed_error_is_protocol_error() {
        assert_eq!(
            parse_error("garbage").unwrap_err().kind(),
            Some(ErrorKind::Protocol)
        );
        assert_eq!(
            parse_error("x,\"y\"").unwrap_err().kind(),
            Some(ErrorKind::Protocol)
        );
        // message without quotes
        assert_eq!(parse_error("-200, Execution error").unwrap(), (-200, "Execution error".into()));
    }

    #[test]
    fn test_identifier_trimmed() {
        let (mut scpi, mock) = scpi();
        mock.respond_to("*IDN?\n", "ACME,PSU-100,SN123,1.0\n");
        assert_eq!(scpi.get_identifier().unwrap(), "ACME,PSU-100,SN123,1.0");
    }

    #[test]
    fn test_common_commands() {
        let (mut scpi, mock) = scpi();
        mock.respond_to("*TST?\n", "0\n");
        mock.respond_to("*OPC?\n", "1\n");

        scpi.clear_status().unwrap();
        scpi.reset().unwrap();
        scpi.wait_to_continue().unwrap();
        assert!(scpi.test().unwrap());
        assert!(scpi.operation_complete(Duration::from_millis(100)).unwrap());

        assert_eq!(
            mock.written_strings(),
            vec!["*CLS\n", "*RST\n", "*WAI\n", "*TST?\n", "*OPC?\n"]
        );
    }

    #[test]
    fn test_wait_to_complete_after_third_poll() {
        let (mut scpi, mock) = scpi();
        mock.queue_str("0\n");
        mock.queue_str("0\n");
        mock.queue_str("1\n");

        scpi.wait_to_complete(Duration::from_secs(1)).unwrap();

        let writes = mock.written_strings();
        assert_eq!(writes[0], "*OPC\n");
        assert_eq!(writes.iter().filter(|w| *w == "*ESR?\n").count(), 3);
    }

    #[test]
    fn test_wait_to_complete_times_out() {
        let (mut scpi, mock) = scpi();
        mock.respond_to("*ESR?\n", "32\n");
        scpi.set_poll_interval(Duration::from_millis(5));

        let start = Instant::now();
        let err = scpi.wait_to_complete(Duration::from_millis(50)).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_event_status_register() {
        let (mut scpi, mock) = scpi();
        mock.queue_str("+161\n");
        let value = scpi.event_status().unwrap();
        assert_eq!(value, 161);
        assert_ne!(value & PON, 0);
        assert_ne!(value & CME, 0);
        assert_ne!(value & OPC, 0);

        mock.queue_str("1.28000E+02\n");
        assert_eq!(scpi.event_status().unwrap(), 128);

        mock.queue_str("300\n");
        assert_eq!(
            scpi.event_status().unwrap_err().kind(),
            Some(ErrorKind::Protocol)
        );
    }

    #[test]
    fn test_into_inner() {
        let (mut scpi, _mock) = scpi();
        scpi.interface_mut().set_timeout(Duration::from_millis(20));
        assert_eq!(scpi.interface().timeout(), Duration::from_millis(20));
        let comm = scpi.into_inner();
        assert!(comm.good());
    }
}
