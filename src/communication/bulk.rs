//! Bulk
//!
//! Encoding and validation of the USBTMC bulk transfer header.
//!
//! Every message on the bulk endpoints starts with a 12 byte header:
//!
//! ```text
//! [MsgID][bTag][~bTag][0x00][TransferSize LE32][bmTransferAttributes][TermChar][0x00][0x00]
//! ```
//!

use crate::constants::{bulk_msg_id, misc, transfer_attr};
use crate::error::Error;

use anyhow::Result;
use tracing::warn;

/// ### USBTMC Header
///
/// The decoded form of a bulk transfer header.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbtmcHeader {
    pub msg_id: u8,
    pub btag: u8,
    /// Payload length, excluding the header and the alignment bytes
    pub transfer_size: u32,
    pub attributes: u8,
    /// Only meaningful in REQUEST_DEV_DEP_MSG_IN with the TERM_CHAR attribute
    pub term_char: u8,
}

impl UsbtmcHeader {
    pub fn dev_dep_msg_out(btag: u8, transfer_size: u32, attributes: u8) -> UsbtmcHeader {
        UsbtmcHeader {
            msg_id: bulk_msg_id::DEV_DEP_MSG_OUT,
            btag,
            transfer_size,
            attributes: attributes & transfer_attr::EOM,
            term_char: 0,
        }
    }

    /// ### Request Dev Dep Msg In
    ///
    /// Ask the device for at most `transfer_size` bytes. The terminating character
    /// is only encoded when the TERM_CHAR attribute is set.
    ///
    pub fn request_dev_dep_msg_in(
        btag: u8,
        transfer_size: u32,
        attributes: u8,
        term_char: u8,
    ) -> UsbtmcHeader {
        let attributes = attributes & transfer_attr::TERM_CHAR;
        UsbtmcHeader {
            msg_id: bulk_msg_id::REQUEST_DEV_DEP_MSG_IN,
            btag,
            transfer_size,
            attributes,
            term_char: if attributes != 0 { term_char } else { 0 },
        }
    }

    pub fn vendor_specific_out(btag: u8, transfer_size: u32) -> UsbtmcHeader {
        UsbtmcHeader {
            msg_id: bulk_msg_id::VENDOR_SPECIFIC_OUT,
            btag,
            transfer_size,
            attributes: 0,
            term_char: 0,
        }
    }

    pub fn request_vendor_specific_in(btag: u8, transfer_size: u32) -> UsbtmcHeader {
        UsbtmcHeader {
            msg_id: bulk_msg_id::REQUEST_VENDOR_SPECIFIC_IN,
            btag,
            transfer_size,
            attributes: 0,
            term_char: 0,
        }
    }

    /// True if the transfer is the last one of the message
    pub fn eom(&self) -> bool {
        self.attributes & transfer_attr::EOM != 0
    }

    pub fn to_bytes(&self) -> [u8; misc::USBTMC_HEADER_SIZE] {
        let mut header = [0x00; misc::USBTMC_HEADER_SIZE];
        header[0] = self.msg_id;
        header[1] = self.btag;
        header[2] = !self.btag;
        header[4..8].copy_from_slice(&self.transfer_size.to_le_bytes());
        header[8] = self.attributes;
        header[9] = self.term_char;
        header
    }

    /// ### Parse
    ///
    /// Decode the first 12 bytes of a transfer. Does not check the tag pair.
    ///
    pub fn parse(bytes: &[u8]) -> Result<UsbtmcHeader> {
        if bytes.len() < misc::USBTMC_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "USBTMC header truncated ({} of {} bytes)",
                bytes.len(),
                misc::USBTMC_HEADER_SIZE
            ))
            .into());
        }

        Ok(UsbtmcHeader {
            msg_id: bytes[0],
            btag: bytes[1],
            transfer_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            attributes: bytes[8],
            term_char: bytes[9],
        })
    }
}

/// Total length of a framed message carrying `payload_len` bytes
pub fn framed_len(payload_len: usize) -> usize {
    (misc::USBTMC_HEADER_SIZE + payload_len + 3) & !3
}

/// ### Frame Message
///
/// Header followed by the payload, zero padded to a multiple of 4 bytes.
///
pub fn frame_message(header: &UsbtmcHeader, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(framed_len(payload.len()));
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    frame.resize(framed_len(payload.len()), 0x00);
    frame
}

/// ### Check Header
///
/// Validate a response header against the request it answers.
///
/// Fails with a protocol error if the MsgID differs from `expected_msg_id` or if
/// the bTag/~bTag pair does not echo `btag`.
///
pub fn check_header(bytes: &[u8], expected_msg_id: u8, btag: u8) -> Result<UsbtmcHeader> {
    let header = UsbtmcHeader::parse(bytes)?;

    if header.msg_id != expected_msg_id {
        warn!(msg_id = header.msg_id, expected = expected_msg_id, "unexpected MsgID");
        return Err(Error::Protocol(format!(
            "unexpected MsgID {} (expected {})",
            header.msg_id, expected_msg_id
        ))
        .into());
    }
    if header.btag != btag || bytes[2] != !btag {
        warn!(btag = header.btag, inverse = bytes[2], expected = btag, "bTag mismatch");
        return Err(Error::Protocol(format!(
            "bTag mismatch: got {}/{}, expected {}/{}",
            header.btag, bytes[2], btag, !btag
        ))
        .into());
    }

    Ok(header)
}
