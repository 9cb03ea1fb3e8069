//! Reassembly and parsing of `hcidump --raw` output.
//!
//! `hcidump` prints every HCI packet as hex, split over several lines:
//!
//! ```text
//! > 04 3E 2B 02 01 03 01 F4 E0 8B 0A 0B D8 1F 02 01 06 1B FF 99 04
//!   05 12 FC 53 94 C3 7C 00 04 FF FC 04 0C AC 36 42 00 CD CB B8 33
//!   4C 88 4F B6
//! < 01 0C 20 02 00 00
//! ```
//!
//! `>` marks packets from the controller, `<` packets sent by the host.
//! [`Framer`] glues the lines of each inbound packet back together and
//! [`parse_frame`] extracts the advertiser address and report bytes from LE
//! advertising report events. Nothing here does I/O.

use crate::advertisement::{Advertisement, HexString};
use crate::mac_address::MacAddress;
use thiserror::Error;

const INBOUND_PREFIX: &str = "> ";
const OUTBOUND_PREFIX: &str = "< ";

/// HCI event packet indicator followed by the LE Meta event code.
const LE_META_EVENT_MARKER: &str = "043E";
/// LE Advertising Report sub-event carrying exactly one report.
const SINGLE_ADVERTISING_REPORT: [u8; 2] = [0x02, 0x01];

/// Packet indicator, event code and parameter length.
const HEADER_LEN: usize = 3;
const ADDRESS_OFFSET: usize = 7;
const PAYLOAD_OFFSET: usize = 13;

/// Reasons a single frame is skipped. None of these end a capture.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("not an LE meta event")]
    NotLeMeta,
    #[error("parameter length {declared} does not match frame length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("not a single LE advertising report")]
    NotAdvertisingReport,
    #[error("frame too short for an advertising report ({0} bytes)")]
    Truncated(usize),
    #[error("invalid hex in frame: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Line accumulator for hcidump output.
#[derive(Debug, Default)]
pub struct Framer {
    pending: Option<String>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of output. Returns a frame when `line` completes one.
    ///
    /// A `> ` line completes the previous inbound packet and starts a new one.
    /// A `< ` line also completes it, but the outbound packet itself is
    /// discarded. Other lines extend the inbound packet being collected and
    /// are dropped when there is none.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim_start();

        if let Some(rest) = line.strip_prefix(INBOUND_PREFIX) {
            self.pending.replace(strip_whitespace(rest))
        } else if line.starts_with(OUTBOUND_PREFIX) {
            // Not a plain reset: the inbound packet before a host command is
            // complete, so it is handed out rather than thrown away.
            self.pending.take()
        } else {
            if let Some(pending) = self.pending.as_mut() {
                pending.extend(line.chars().filter(|c| !c.is_whitespace()));
            }
            None
        }
    }

    /// Take the packet still being collected, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.pending.take()
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Parse one reassembled frame into an [`Advertisement`].
///
/// The frame must be an LE advertising report event whose parameter length
/// matches the data that was captured. The address is converted from wire
/// order and everything after it is returned untouched as the payload.
pub fn parse_frame(frame: &str) -> Result<Advertisement, FrameError> {
    let frame = frame.to_ascii_uppercase();

    if !frame.starts_with(LE_META_EVENT_MARKER) {
        return Err(FrameError::NotLeMeta);
    }

    let bytes = hex::decode(&frame)?;
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated(bytes.len()));
    }

    let declared = usize::from(bytes[2]);
    let actual = bytes.len() - HEADER_LEN;
    if declared != actual {
        return Err(FrameError::LengthMismatch { declared, actual });
    }

    if bytes.get(HEADER_LEN..HEADER_LEN + 2) != Some(&SINGLE_ADVERTISING_REPORT[..]) {
        return Err(FrameError::NotAdvertisingReport);
    }

    // Event type and address type sit between the report count and the
    // address. Tags differ in both, so they are not checked.
    let mac = bytes
        .get(ADDRESS_OFFSET..PAYLOAD_OFFSET)
        .and_then(MacAddress::from_wire)
        .ok_or(FrameError::Truncated(bytes.len()))?;

    Ok(Advertisement::new(
        Some(mac),
        HexString::from_bytes(&bytes[PAYLOAD_OFFSET..]),
    ))
}
