//! ## Device
//!
//! Building blocks for instrument drivers: a named slot holding the one interface
//! a driver talks through, and small helpers for argument checks and reply parsing.
//!

use anyhow::Result;
use tracing::info;

use crate::error::Error;
use crate::interface::Interface;

/// ### Device Link
///
/// Binding between a driver and its interface.
///
/// The link owns the interface exclusively while bound. [`DeviceLink::disconnect`]
/// hands it back.
///
#[derive(Debug)]
pub struct DeviceLink<I: Interface> {
    name: String,
    comm: Option<I>,
}

impl<I: Interface> DeviceLink<I> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comm: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// ### Bind
    ///
    /// Take ownership of an open interface.
    ///
    /// Fails if an interface is already bound or `comm` is not usable. On failure
    /// `comm` is dropped and the link is left as it was.
    ///
    pub fn bind(&mut self, comm: I) -> Result<()> {
        if self.comm.is_some() {
            return Err(Error::Configuration(format!("{}: device is already connected", self.name)).into());
        }
        if !comm.good() {
            return Err(Error::not_connected(&comm.info()).into());
        }

        info!(device = %self.name, interface = %comm.info(), "device connected");
        self.comm = Some(comm);
        Ok(())
    }

    pub fn comm(&self) -> Result<&I> {
        match self.comm {
            Some(ref comm) => Ok(comm),
            None => Err(Error::connection(format!("{}: device is not connected", self.name)).into()),
        }
    }

    pub fn comm_mut(&mut self) -> Result<&mut I> {
        match self.comm {
            Some(ref mut comm) => Ok(comm),
            None => Err(Error::connection(format!("{}: device is not connected", self.name)).into()),
        }
    }

    /// True if an interface is bound and still usable
    pub fn connected(&self) -> bool {
        self.comm.as_ref().is_some_and(|comm| comm.good())
    }

    /// Release the interface without closing it
    pub fn disconnect(&mut self) -> Option<I> {
        let comm = self.comm.take();
        if comm.is_some() {
            info!(device = %self.name, "device disconnected");
        }
        comm
    }

    /// `name;interface-info`, or just the name while unbound
    pub fn info(&self) -> String {
        match self.comm {
            Some(ref comm) => format!("{};{}", self.name, comm.info()),
            None => self.name.clone(),
        }
    }
}

/// ### Check Channel
///
/// Channels are numbered from 1 to `max`.
///
pub fn check_channel(channel: u32, max: u32) -> Result<()> {
    if channel == 0 || channel > max {
        return Err(Error::Configuration(format!("channel {channel} out of range 1..={max}")).into());
    }
    Ok(())
}

/// ### Split Response
///
/// Split `text` on `delim` into at most `max_parts` trimmed fields, the last
/// field keeps the remaining delimiters. `max_parts == 0` means no limit.
///
/// `split_response("ACME,PSU,SN1,1.0,b", ",", 4)` gives
/// `["ACME", "PSU", "SN1", "1.0,b"]`.
///
pub fn split_response(text: &str, delim: &str, max_parts: usize) -> Vec<String> {
    let text = text.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = match max_parts {
        0 => text.split(delim).collect(),
        n => text.splitn(n, delim).collect(),
    };
    parts.into_iter().map(|part| part.trim().to_string()).collect()
}
