//! Conversion of observer records into the hcidump payload shape.
//!
//! Frames parsed from hcidump carry the whole report after the address:
//! data length, AD structures and RSSI. An observer only hands over the
//! manufacturer data, so it is wrapped in an envelope that a payload decoder
//! scanning for the `0xFF` AD structure reads the same way:
//!
//! ```text
//! [len + 2] [len + 1] FF <manufacturer data, len bytes>
//! ```

use crate::advertisement::{Advertisement, HexString};
use crate::mac_address::MacAddress;
use tracing::debug;

/// AD type of manufacturer specific data.
pub const MANUFACTURER_DATA_TYPE: u8 = 0xFF;

/// One advertisement as reported by a native BLE observer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObservedRecord {
    /// Not every platform reports the advertiser address.
    pub mac: Option<MacAddress>,
    /// Manufacturer data including the little-endian company id.
    pub manufacturer_data: Option<Vec<u8>>,
}

impl ObservedRecord {
    /// Build a record from a company id and data reported separately, as
    /// BlueZ does.
    pub fn from_company_data(mac: Option<MacAddress>, company_id: u16, data: &[u8]) -> Self {
        Self {
            mac,
            manufacturer_data: Some(flatten_manufacturer_data(company_id, data)),
        }
    }
}

/// Join a company id and its data into the byte sequence sent over the air.
pub fn flatten_manufacturer_data(company_id: u16, data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + data.len());
    bytes.extend_from_slice(&company_id.to_le_bytes());
    bytes.extend_from_slice(data);
    bytes
}

/// Wrap manufacturer data in the length-prefixed `0xFF` envelope.
///
/// Returns `None` when the data does not fit in a one-byte length.
pub fn envelope(manufacturer_data: &[u8]) -> Option<HexString> {
    let inner = u8::try_from(manufacturer_data.len() + 1).ok()?;
    let outer = inner.checked_add(1)?;

    let mut bytes = Vec::with_capacity(manufacturer_data.len() + 3);
    bytes.push(outer);
    bytes.push(inner);
    bytes.push(MANUFACTURER_DATA_TYPE);
    bytes.extend_from_slice(manufacturer_data);
    Some(HexString::from_bytes(&bytes))
}

/// Normalize an observer record. Records without manufacturer data are dropped.
pub fn normalize(record: &ObservedRecord) -> Option<Advertisement> {
    let data = record.manufacturer_data.as_deref()?;
    match envelope(data) {
        Some(payload) => Some(Advertisement::new(record.mac, payload)),
        None => {
            debug!(
                "Dropping oversized manufacturer data ({} bytes) from {:?}",
                data.len(),
                record.mac
            );
            None
        }
    }
}
