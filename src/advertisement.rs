//! The normalized advertisement tuple handed to payload decoders.

use crate::mac_address::MacAddress;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper-case hex text with an even number of digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HexString(String);

/// Errors returned when parsing a [`HexString`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HexError {
    #[error("hex string has odd length {0}")]
    OddLength(usize),
    #[error("invalid hex digit {0:?} at offset {1}")]
    InvalidDigit(char, usize),
}

impl HexString {
    /// Encode raw bytes as upper-case hex.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of bytes the digits encode.
    pub fn byte_len(&self) -> usize {
        self.0.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Construction guarantees valid even-length hex.
        hex::decode(&self.0).unwrap_or_default()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl FromStr for HexString {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((offset, c)) = s.char_indices().find(|(_, c)| !c.is_ascii_hexdigit()) {
            return Err(HexError::InvalidDigit(c, offset));
        }
        if s.len() % 2 != 0 {
            return Err(HexError::OddLength(s.len()));
        }
        Ok(Self(s.to_ascii_uppercase()))
    }
}

impl fmt::Display for HexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for HexString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One advertisement as produced by either capture backend.
///
/// `mac` is absent when the platform does not expose the advertiser address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub mac: Option<MacAddress>,
    pub payload: HexString,
}

impl Advertisement {
    pub fn new(mac: Option<MacAddress>, payload: HexString) -> Self {
        Self { mac, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_is_upper_case() {
        let hex = HexString::from_bytes(&[0x99, 0x04, 0xab]);
        assert_eq!(hex.as_str(), "9904AB");
        assert_eq!(hex.byte_len(), 3);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let hex: HexString = "0201abCD".parse().unwrap();
        assert_eq!(hex.as_str(), "0201ABCD");
        assert_eq!(hex.to_bytes(), vec![0x02, 0x01, 0xAB, 0xCD]);
    }

    #[test]
    fn test_parse_rejects_odd_length() {
        assert_eq!("ABC".parse::<HexString>(), Err(HexError::OddLength(3)));
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert_eq!(
            "AB CD".parse::<HexString>(),
            Err(HexError::InvalidDigit(' ', 2))
        );
        assert_eq!(
            "0x12".parse::<HexString>(),
            Err(HexError::InvalidDigit('x', 1))
        );
    }

    #[test]
    fn test_empty_is_valid() {
        let hex: HexString = "".parse().unwrap();
        assert!(hex.is_empty());
        assert_eq!(hex.to_string(), "");
    }
}
