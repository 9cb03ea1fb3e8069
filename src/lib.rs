//! `ble-adcapture` library.
//!
//! Captures BLE advertisements from either `hcidump` or the BlueZ observer
//! API and hands them out as `(MAC, hex payload)` pairs of the same shape,
//! whichever backend produced them.
//!
//! ```no_run
//! use ble_adcapture::{ScanConfig, scanner};
//!
//! # async fn run() -> Result<(), ble_adcapture::ScanError> {
//! let config = ScanConfig::default();
//! let mut stream = scanner::get_datas(&config).await?;
//! while let Some(advertisement) = stream.next().await {
//!     println!("{:?} {}", advertisement.mac, advertisement.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod advertisement;
pub mod config;
pub mod frame;
pub mod mac_address;
pub mod normalize;
pub mod scanner;
pub mod session;
pub mod stream;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{Advertisement, HexString};
pub use config::{RetryPolicy, ScanConfig, parse_duration};
pub use frame::{FrameError, Framer, parse_frame};
pub use mac_address::MacAddress;
pub use normalize::{ObservedRecord, normalize};
pub use scanner::{Backend, ScanError, get_data, get_datas};
pub use session::{Blacklist, Phase, Session};
pub use stream::{AdvertisementStream, Communication, find_one};
