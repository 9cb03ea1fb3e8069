//! Capture backends and backend selection.
//!
//! Two backends produce the same [`Advertisement`](crate::advertisement::Advertisement)
//! stream:
//!
//! - `hcidump`: runs `hcitool lescan2` to keep the controller scanning and
//!   parses the raw HCI dump printed by `hcidump --raw`.
//! - `bluer`: observes advertisements through the BlueZ D-Bus API.
//!
//! Both implement [`Communication`], so callers pick one with
//! [`Backend::select`] and never look at it again.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hcidump")]
pub mod hcidump;

#[cfg(feature = "hcidump")]
pub mod process;

use crate::advertisement::HexString;
use crate::config::ScanConfig;
use crate::mac_address::MacAddress;
use crate::stream::{AdvertisementStream, Communication};
use std::io;
use thiserror::Error;
use tracing::warn;

/// Environment variable naming the backend when the caller does not.
pub const ADAPTER_ENV: &str = "RUUVI_BLE_ADAPTER";

/// Device used by the hcidump backend when none is given.
pub const DEFAULT_HCI_DEVICE: &str = "hci0";

/// Error type for capture sessions.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend known but not compiled in
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    #[error("Invalid Bluetooth device: {0}")]
    InvalidDevice(String),
    /// The adapter could not be reset; the session never started.
    #[error("Resetting {device} failed after {attempts} attempts: {reason}")]
    AdapterReset {
        device: String,
        attempts: u32,
        reason: String,
    },
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Capture session was already started")]
    AlreadyStarted,
    /// The capture process closed its output.
    #[error("EOF received from capture process")]
    CaptureEof,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Available capture backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus observer (requires bluetoothd)
    #[cfg(feature = "bluer")]
    #[value(alias = "bleson")]
    Bluer,
    /// hcitool + hcidump subprocesses (requires sudo or capabilities)
    #[cfg(feature = "hcidump")]
    /// `bluez` names the BlueZ utilities, as in ruuvitag-sensor's RUUVI_BLE_ADAPTER.
    #[value(alias = "nix", alias = "bluez")]
    Hcidump,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "hcidump")]
        return Backend::Hcidump;
        #[cfg(all(feature = "bluer", not(feature = "hcidump")))]
        return Backend::Bluer;
        #[cfg(not(any(feature = "bluer", feature = "hcidump")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hcidump")]
            Backend::Hcidump => write!(f, "hcidump"),
            #[cfg(not(any(feature = "bluer", feature = "hcidump")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = ScanError;

    // The "not compiled in" arm only matches when a backend feature is off.
    #[allow(unreachable_patterns)]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bleson" | "observer" => Ok(Backend::Bluer),
            #[cfg(feature = "hcidump")]
            "hcidump" | "bluez" | "nix" | "nix_hci" | "process" => Ok(Backend::Hcidump),
            name @ ("bluer" | "bleson" | "observer" | "hcidump" | "bluez" | "nix" | "nix_hci"
            | "process") => Err(ScanError::BackendNotAvailable(name.to_string())),
            _ => Err(ScanError::UnknownBackend(s.to_string())),
        }
    }
}

impl Backend {
    /// Pick the backend for a session.
    ///
    /// An explicit request wins, then [`ADAPTER_ENV`], then the compiled-in
    /// default. An unusable environment value is logged and ignored.
    pub fn select(requested: Option<Backend>) -> Backend {
        requested
            .or_else(|| Self::from_env_value(std::env::var(ADAPTER_ENV).ok().as_deref()))
            .unwrap_or_default()
    }

    fn from_env_value(value: Option<&str>) -> Option<Backend> {
        let value = value?.trim();
        if value.is_empty() {
            return None;
        }
        match value.parse() {
            Ok(backend) => Some(backend),
            Err(e) => {
                warn!("Ignoring {ADAPTER_ENV}={value}: {e}");
                None
            }
        }
    }
}

/// Device name for the hcidump backend. Empty means [`DEFAULT_HCI_DEVICE`].
pub fn process_device(device: &str) -> String {
    match device.trim() {
        "" => DEFAULT_HCI_DEVICE.to_string(),
        device => device.to_string(),
    }
}

/// Adapter index for the observer backend.
///
/// Accepts an empty string (adapter 0), a bare index, or the `hciN` names
/// used with the hcidump backend.
pub fn observer_adapter_index(device: &str) -> Result<usize, ScanError> {
    let device = device.trim();
    if device.is_empty() {
        return Ok(0);
    }
    device
        .strip_prefix("hci")
        .unwrap_or(device)
        .parse()
        .map_err(|_| ScanError::InvalidDevice(device.to_string()))
}

/// Create the communication object for the configured backend.
pub fn communication(config: &ScanConfig) -> Box<dyn Communication> {
    match Backend::select(config.backend) {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Box::new(bluer::BluerCommunication::new(config)),
        #[cfg(feature = "hcidump")]
        Backend::Hcidump => Box::new(hcidump::HcidumpCommunication::new(config)),
    }
}

/// Stream advertisements using the device and blacklist from `config`.
pub async fn get_datas(config: &ScanConfig) -> Result<AdvertisementStream, ScanError> {
    communication(config)
        .get_datas(config.blacklist(), &config.device)
        .await
}

/// Wait for the first advertisement from `mac` and return its payload.
pub async fn get_data(config: &ScanConfig, mac: MacAddress) -> Result<Option<HexString>, ScanError> {
    communication(config).get_data(mac, &config.device).await
}
