//! ## Errors
//!
//! The errors used throughout the crate.
//!
//! Public functions return [`anyhow::Result`] and raise [`Error`] variants. Use
//! [`ErrorExt::kind`] on the returned [`anyhow::Error`] to branch on the kind
//! of failure (for example to retry after a [`ErrorKind::Timeout`]).
//!

use std::io;

/// ### Error Kind
///
/// Coarse classification of every failure the crate can raise.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An I/O wait or a completion poll exceeded its deadline. Recoverable.
    Timeout,
    /// The channel could not be opened or has been lost. Reopen to recover.
    Connection,
    /// A read or write failed at the OS boundary for another reason.
    Io,
    /// A response violated the expected protocol shape.
    Protocol,
    /// The instrument itself reported a fault.
    Device,
    /// The caller supplied unsupported parameters.
    Configuration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection error: {message}")]
    Connection { message: String, code: Option<i32> },
    #[error("i/o error: {message}")]
    Io { message: String, code: Option<i32> },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device error {code}: {message}")]
    Device { code: i32, message: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("device not found")]
    DeviceNotFound,
    #[error("device is not compatible with USBTMC")]
    DeviceIncompatible,
    #[error("specified interface not found")]
    InterfaceNotFound,
    #[error("specified interface setting not found")]
    InterfaceSettingNotFound,
    #[error("bulk out endpoint not found")]
    BulkOutEndpointNotFound,
    #[error("bulk in endpoint not found")]
    BulkInEndpointNotFound,
    #[error("used incorrect endpoint")]
    IncorrectEndpoint,
    #[error("bulk in FIFO did not drain")]
    BulkInFifoNotEmpty,
    #[error("control request failed")]
    StatusFailure,
    #[error("control request unexpectedly failed (status 0x{0:02X})")]
    StatusUnexpectedFailure(u8),
}

impl Error {
    /// ### Kind
    ///
    /// Classify the error.
    ///
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Connection { .. } | Error::DeviceNotFound => ErrorKind::Connection,
            Error::Io { .. } => ErrorKind::Io,
            Error::Protocol(_)
            | Error::StatusFailure
            | Error::StatusUnexpectedFailure(_)
            | Error::BulkInFifoNotEmpty => ErrorKind::Protocol,
            Error::Device { .. } => ErrorKind::Device,
            Error::Configuration(_)
            | Error::DeviceIncompatible
            | Error::InterfaceNotFound
            | Error::InterfaceSettingNotFound
            | Error::BulkOutEndpointNotFound
            | Error::BulkInEndpointNotFound
            | Error::IncorrectEndpoint => ErrorKind::Configuration,
        }
    }

    /// ### Code
    ///
    /// Numeric code reported by the OS or the instrument, if any.
    ///
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Connection { code, .. } | Error::Io { code, .. } => *code,
            Error::Device { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Error raised by any I/O call on a handle that is not ready.
    pub fn not_connected(info: &str) -> Error {
        Error::Connection {
            message: format!("{info}: interface not ready"),
            code: None,
        }
    }

    pub(crate) fn connection(message: impl Into<String>) -> Error {
        Error::Connection {
            message: message.into(),
            code: None,
        }
    }
}

/// ### IO Error
///
/// Map an OS level error onto the crate taxonomy, prefixing `context`.
///
pub fn io_error(err: io::Error, context: &str) -> Error {
    let message = format!("{context} ({err})");
    let code = err.raw_os_error();
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout(message),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::AddrNotAvailable => Error::Connection { message, code },
        _ => Error::Io { message, code },
    }
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        let message = format!("usb: {err}");
        match err {
            rusb::Error::Timeout => Error::Timeout(message),
            rusb::Error::NoDevice | rusb::Error::NotFound | rusb::Error::Access | rusb::Error::Busy => {
                Error::connection(message)
            }
            rusb::Error::InvalidParam | rusb::Error::NotSupported => Error::Configuration(message),
            _ => Error::Io {
                message,
                code: None,
            },
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::NoDevice => Error::connection(err.description),
            serialport::ErrorKind::InvalidInput => Error::Configuration(err.description),
            serialport::ErrorKind::Io(kind) => io_error(io::Error::new(kind, err.description), "serial port"),
            serialport::ErrorKind::Unknown => Error::Io {
                message: err.description,
                code: None,
            },
        }
    }
}

/// ### Error Extension
///
/// Inspect an [`anyhow::Error`] returned by this crate.
///
pub trait ErrorExt {
    /// The kind of the underlying crate error, if it is one.
    fn kind(&self) -> Option<ErrorKind>;

    /// True if the failure was a timeout.
    fn is_timeout(&self) -> bool {
        self.kind() == Some(ErrorKind::Timeout)
    }
}

impl ErrorExt for anyhow::Error {
    fn kind(&self) -> Option<ErrorKind> {
        if let Some(err) = self.downcast_ref::<Error>() {
            return Some(err.kind());
        }
        if let Some(err) = self.downcast_ref::<rusb::Error>() {
            return Some(Error::from(*err).kind());
        }
        self.downcast_ref::<io::Error>()
            .map(|err| io_error(io::Error::from(err.kind()), "").kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err = io_error(io::Error::from(io::ErrorKind::TimedOut), "read");
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = io_error(io::Error::from(io::ErrorKind::ConnectionRefused), "connect");
        assert_eq!(err.kind(), ErrorKind::Connection);

        let err = io_error(io::Error::from_raw_os_error(5), "write");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.code(), Some(5));
    }

    #[test]
    fn test_usb_error_mapping() {
        assert_eq!(Error::from(rusb::Error::Timeout).kind(), ErrorKind::Timeout);
        assert_eq!(Error::from(rusb::Error::NoDevice).kind(), ErrorKind::Connection);
        assert_eq!(Error::from(rusb::Error::Pipe).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_anyhow_kind() {
        let err: anyhow::Error = Error::Device {
            code: -113,
            message: "Undefined header".into(),
        }
        .into();
        assert_eq!(err.kind(), Some(ErrorKind::Device));
        assert!(!err.is_timeout());

        let err: anyhow::Error = Error::Timeout("read".into()).into();
        assert!(err.is_timeout());

        let err = anyhow::anyhow!("unrelated");
        assert_eq!(err.kind(), None);
    }
}
