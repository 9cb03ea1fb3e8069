//! Capture configuration.
//!
//! [`ScanConfig`] derives [`clap::Args`] so an application can flatten it
//! into its own command line; the library itself never parses arguments.

use crate::mac_address::MacAddress;
use crate::scanner::Backend;
use crate::session::Blacklist;
use clap::ArgAction;
use std::time::Duration;

/// How often an idle producer checks whether it should stop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Retries after the first failed adapter reset.
pub const DEFAULT_RESET_RETRIES: u32 = 3;
/// Delay before the first reset retry. Doubles after every retry.
pub const DEFAULT_RESET_DELAY: Duration = Duration::from_secs(1);

/// Settings for one capture session.
#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct ScanConfig {
    /// Capture backend. Defaults to $RUUVI_BLE_ADAPTER, then the compiled-in default.
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Bluetooth device (hci0) or adapter index. Empty selects the first one.
    #[arg(long, default_value = "")]
    pub device: String,

    /// Ignore advertisements from this MAC address. Can be repeated.
    #[arg(long = "blacklist", value_name = "MAC")]
    pub blacklist: Vec<MacAddress>,

    /// How often an idle capture checks for shutdown (e.g. 100ms).
    #[arg(long, value_parser = parse_duration, default_value = "100ms")]
    pub poll_interval: Duration,

    /// Number of times to retry a failed adapter reset.
    #[arg(long, default_value_t = DEFAULT_RESET_RETRIES)]
    pub reset_retries: u32,

    /// Delay before the first reset retry (e.g. 1s).
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub reset_delay: Duration,

    /// Run hciconfig, hcitool and hcidump directly instead of through sudo.
    #[arg(long = "no-sudo", action = ArgAction::SetFalse)]
    pub use_sudo: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            backend: None,
            device: String::new(),
            blacklist: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            reset_retries: DEFAULT_RESET_RETRIES,
            reset_delay: DEFAULT_RESET_DELAY,
            use_sudo: true,
        }
    }
}

impl ScanConfig {
    pub fn blacklist(&self) -> Blacklist {
        self.blacklist.iter().copied().collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.reset_retries,
            initial_delay: self.reset_delay,
        }
    }
}

/// Bounded retry with a delay that doubles after each failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts made after the first one.
    pub retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RESET_RETRIES,
            initial_delay: DEFAULT_RESET_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delays slept between attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        std::iter::successors(Some(self.initial_delay), |d| d.checked_add(*d))
            .take(self.retries as usize)
    }
}

/// Parse a duration such as `100ms`, `3s`, `1m` or `2h`.
///
/// A bare number is interpreted as seconds.
///
/// ```
/// use ble_adcapture::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let split = src.find(|c: char| !c.is_ascii_digit()).unwrap_or(src.len());
    let (number, unit) = src.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit '{}' in {}", other, src)),
    }
}
