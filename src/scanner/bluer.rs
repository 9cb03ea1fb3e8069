//! BlueZ D-Bus observer backend.
//!
//! This backend uses the `bluer` crate to talk to the BlueZ daemon over
//! D-Bus, so it requires `bluetoothd` to be running. BlueZ reports the
//! manufacturer data of a device keyed by company id; every entry is
//! normalized into the same payload shape the hcidump backend produces.

use super::{ScanError, observer_adapter_index};
use crate::advertisement::Advertisement;
use crate::config::ScanConfig;
use crate::mac_address::MacAddress;
use crate::normalize::{ObservedRecord, normalize};
use crate::session::{Blacklist, Capture, CaptureSource};
use crate::stream::{AdvertisementStream, Communication};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

type AdapterEvents = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// Pick the adapter at `index`, counting in `hci0, hci1, ..., hci10` order.
fn adapter_name_at(mut names: Vec<String>, index: usize) -> Result<String, ScanError> {
    names.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    names
        .into_iter()
        .nth(index)
        .ok_or_else(|| ScanError::InvalidDevice(format!("no Bluetooth adapter with index {index}")))
}

/// Normalized advertisements for one device, ordered by company id.
fn records(mac: MacAddress, manufacturer_data: HashMap<u16, Vec<u8>>) -> Vec<Advertisement> {
    let mut entries: Vec<(u16, Vec<u8>)> = manufacturer_data.into_iter().collect();
    entries.sort_by_key(|(company_id, _)| *company_id);
    entries
        .iter()
        .map(|(company_id, data)| ObservedRecord::from_company_data(Some(mac), *company_id, data))
        .filter_map(|record| normalize(&record))
        .collect()
}

/// Active discovery on one adapter.
pub struct BluerCapture {
    _session: Session,
    adapter: Adapter,
    events: Option<AdapterEvents>,
    pending: VecDeque<Advertisement>,
}

/// Read the manufacturer data BlueZ currently holds for `address`.
///
/// Borrows only the adapter, so the future stays `Send` while the capture
/// itself is borrowed mutably.
async fn device_records(adapter: &Adapter, address: Address) -> Result<Vec<Advertisement>, ScanError> {
    let device = adapter.device(address)?;
    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(Vec::new());
    };
    Ok(records(address.into(), manufacturer_data))
}

impl Capture for BluerCapture {
    fn next(&mut self, idle: Duration) -> BoxFuture<'_, Result<Option<Advertisement>, ScanError>> {
        Box::pin(async move {
            if let Some(advertisement) = self.pending.pop_front() {
                return Ok(Some(advertisement));
            }

            let Some(events) = self.events.as_mut() else {
                return Err(ScanError::Bluetooth("discovery was stopped".to_string()));
            };

            let event = match tokio::time::timeout(idle, events.next()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(ScanError::Bluetooth("discovery stream ended".to_string()));
                }
                Err(_) => return Ok(None),
            };

            // Property changes are reported as DeviceAdded as well.
            let AdapterEvent::DeviceAdded(address) = event else {
                return Ok(None);
            };

            match device_records(&self.adapter, address).await {
                Ok(records) => {
                    self.pending.extend(records);
                    Ok(self.pending.pop_front())
                }
                Err(e) => {
                    // The device may have vanished between the event and the read.
                    debug!("Could not read {address}: {e}");
                    Ok(None)
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Dropping the event stream ends the discovery session.
            if self.events.take().is_some() {
                info!("Stop receiving broadcasts");
            }
            self.pending.clear();
        })
    }
}

/// Starts a [`BluerCapture`] on the adapter at `adapter_index`.
#[derive(Debug, Clone, Copy)]
pub struct BluerSource {
    pub adapter_index: usize,
}

impl BluerSource {
    async fn start(self) -> Result<BluerCapture, ScanError> {
        let session = Session::new().await?;
        let name = adapter_name_at(session.adapter_names().await?, self.adapter_index)?;
        info!("Start receiving broadcasts (adapter {name})");

        let adapter = session.adapter(&name)?;
        adapter.set_powered(true).await?;
        adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            })
            .await?;

        let events = adapter.discover_devices_with_changes().await?;
        Ok(BluerCapture {
            _session: session,
            adapter,
            events: Some(Box::pin(events)),
            pending: VecDeque::new(),
        })
    }
}

impl CaptureSource for BluerSource {
    fn open(self) -> BoxFuture<'static, Result<Box<dyn Capture>, ScanError>> {
        Box::pin(async move {
            let capture = self.start().await?;
            Ok(Box::new(capture) as Box<dyn Capture>)
        })
    }
}

/// [`Communication`] over the BlueZ D-Bus API.
#[derive(Debug, Clone)]
pub struct BluerCommunication {
    poll_interval: Duration,
}

impl BluerCommunication {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
        }
    }
}

impl Communication for BluerCommunication {
    fn get_datas<'a>(
        &'a self,
        blacklist: Blacklist,
        device: &'a str,
    ) -> BoxFuture<'a, Result<AdvertisementStream, ScanError>> {
        Box::pin(async move {
            let source = BluerSource {
                adapter_index: observer_adapter_index(device)?,
            };
            AdvertisementStream::open(source, blacklist, self.poll_interval).await
        })
    }
}
