//! Device discovery and presence monitoring.
//!
//! [`scan_for_devices`] runs a one-shot scan and returns the toothbrushes it
//! heard. [`PresenceMonitor`] keeps scanning and turns the adapter's event
//! stream into [`PresenceEvent`]s for the
//! [`RecoverySupervisor`](crate::RecoverySupervisor).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use laifen_types::{DeviceIdentity, is_toothbrush_name};

use crate::ble::{BleTransport, peripheral_identity};
use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::supervisor::PresenceEvent;

/// A toothbrush heard during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Normalized address (peripheral UUID on macOS).
    pub identity: DeviceIdentity,
    /// Advertised name.
    pub name: Option<String>,
    /// Signal strength.
    pub rssi: Option<i16>,
    /// The peripheral, for building a transport.
    pub peripheral: Peripheral,
}

impl DiscoveredDevice {
    /// Wrap the peripheral in a transport.
    pub fn into_transport(self, adapter: Adapter) -> BleTransport {
        BleTransport::from_parts(adapter, self.peripheral, self.identity, self.name)
    }
}

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to scan for devices.
    pub duration: Duration,
    /// Only report devices whose name looks like a toothbrush.
    pub toothbrushes_only: bool,
    /// Only report these identities (all when `None`).
    pub identities: Option<HashSet<DeviceIdentity>>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            toothbrushes_only: true,
            identities: None,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Report every BLE device, not just toothbrushes.
    #[must_use]
    pub fn all_devices(mut self) -> Self {
        self.toothbrushes_only = false;
        self
    }

    /// Restrict to the given identities.
    #[must_use]
    pub fn identities(mut self, identities: impl IntoIterator<Item = DeviceIdentity>) -> Self {
        self.identities = Some(identities.into_iter().collect());
        self
    }

    /// Whether a device with this identity and name passes the filters.
    pub fn accepts(&self, identity: &DeviceIdentity, name: Option<&str>) -> bool {
        if let Some(identities) = &self.identities
            && !identities.contains(identity)
        {
            return false;
        }
        !self.toothbrushes_only || name.is_some_and(is_toothbrush_name)
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Scan for toothbrushes in range.
///
/// An empty list means nothing was heard; it is not an error.
pub async fn scan_for_devices(options: ScanOptions) -> Result<Vec<DiscoveredDevice>> {
    let adapter = get_adapter().await?;
    scan_with_adapter(&adapter, &options).await
}

/// Scan using a specific adapter.
pub async fn scan_with_adapter(
    adapter: &Adapter,
    options: &ScanOptions,
) -> Result<Vec<DiscoveredDevice>> {
    info!(duration = ?options.duration, "Starting BLE scan");

    adapter.start_scan(ScanFilter::default()).await?;
    sleep(options.duration).await;
    adapter.stop_scan().await?;

    let mut discovered = Vec::new();
    for peripheral in adapter.peripherals().await? {
        match inspect_peripheral(peripheral, options).await {
            Ok(Some(device)) => {
                debug!(device = %device.identity, name = ?device.name, "Found toothbrush");
                discovered.push(device);
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Error processing peripheral"),
        }
    }

    info!(count = discovered.len(), "Scan complete");
    Ok(discovered)
}

/// Find one device by identity, scanning if the adapter does not know it yet.
pub async fn find_device(adapter: &Adapter, identity: &DeviceIdentity) -> Result<DiscoveredDevice> {
    let options = ScanOptions::default().all_devices().identities([identity.clone()]);

    for peripheral in adapter.peripherals().await? {
        if let Ok(Some(device)) = inspect_peripheral(peripheral, &options).await {
            return Ok(device);
        }
    }

    scan_with_adapter(adapter, &options)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::device_not_found(identity.as_str()))
}

async fn inspect_peripheral(
    peripheral: Peripheral,
    options: &ScanOptions,
) -> Result<Option<DiscoveredDevice>> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    let identity = peripheral_identity(properties.address, &peripheral.id());
    if !options.accepts(&identity, properties.local_name.as_deref()) {
        return Ok(None);
    }

    Ok(Some(DiscoveredDevice {
        identity,
        name: properties.local_name,
        rssi: properties.rssi,
        peripheral,
    }))
}

/// Rate limit for repeated sightings of the same device.
#[derive(Debug)]
pub struct SeenDebouncer {
    window: Duration,
    last: HashMap<DeviceIdentity, Instant>,
}

impl SeenDebouncer {
    /// Suppress sightings closer together than `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Record a sighting at `now`; returns whether it should be reported.
    pub fn should_report(&mut self, identity: &DeviceIdentity, now: Instant) -> bool {
        match self.last.get(identity) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last.insert(identity.clone(), now);
                true
            }
        }
    }

    /// Forget a device so its next sighting is reported immediately.
    pub fn reset(&mut self, identity: &DeviceIdentity) {
        self.last.remove(identity);
    }
}

/// Continuous scan that reports toothbrushes appearing and disappearing.
#[derive(Debug, Clone)]
pub struct PresenceMonitor {
    adapter: Adapter,
    options: ScanOptions,
    debounce: Duration,
}

impl PresenceMonitor {
    /// Default interval between reported sightings of one device.
    pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

    /// Monitor toothbrushes on `adapter`.
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            options: ScanOptions::default(),
            debounce: Self::DEFAULT_DEBOUNCE,
        }
    }

    /// Only report these identities.
    #[must_use]
    pub fn identities(mut self, identities: impl IntoIterator<Item = DeviceIdentity>) -> Self {
        self.options = self.options.identities(identities);
        self
    }

    /// Set the sighting debounce window.
    #[must_use]
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Scan until `cancel` fires, sending signals into `tx`.
    pub async fn run(self, tx: mpsc::Sender<PresenceEvent>, cancel: CancellationToken) -> Result<()> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Presence monitor started");

        let mut debouncer = SeenDebouncer::new(self.debounce);
        let mut known: HashMap<PeripheralId, DeviceIdentity> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => event,
                    None => {
                        warn!("Adapter event stream ended");
                        break;
                    }
                },
            };

            let signal = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    self.sighting(id, &mut known, &mut debouncer).await
                }
                CentralEvent::DeviceDisconnected(id) => known.get(&id).map(|identity| {
                    debouncer.reset(identity);
                    PresenceEvent::Lost {
                        identity: identity.clone(),
                    }
                }),
                _ => None,
            };

            if let Some(signal) = signal
                && tx.send(signal).await.is_err()
            {
                debug!("Presence receiver dropped");
                break;
            }
        }

        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "Failed to stop scan");
        }
        info!("Presence monitor stopped");
        Ok(())
    }

    async fn sighting(
        &self,
        id: PeripheralId,
        known: &mut HashMap<PeripheralId, DeviceIdentity>,
        debouncer: &mut SeenDebouncer,
    ) -> Option<PresenceEvent> {
        let peripheral = self.adapter.peripheral(&id).await.ok()?;
        let device = match inspect_peripheral(peripheral, &self.options).await {
            Ok(device) => device?,
            Err(e) => {
                debug!(error = %e, "Failed to read peripheral properties");
                return None;
            }
        };

        known.insert(id, device.identity.clone());
        if !debouncer.should_report(&device.identity, Instant::now()) {
            return None;
        }

        debug!(device = %device.identity, rssi = ?device.rssi, "Toothbrush seen");
        let identity = device.identity.clone();
        let name = device.name.clone();
        Some(PresenceEvent::Seen {
            identity,
            name,
            handle: Box::new(device.into_transport(self.adapter.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_options_defaults() {
        let options = ScanOptions::default();
        assert_eq!(options.duration, Duration::from_secs(5));
        assert!(options.toothbrushes_only);
        assert!(options.identities.is_none());
    }

    #[test]
    fn test_accepts_name_filter() {
        let options = ScanOptions::default();
        let id = DeviceIdentity::new("AA");

        assert!(options.accepts(&id, Some("LFTB-1234")));
        assert!(options.accepts(&id, Some("Laifen Toothbrush")));
        assert!(!options.accepts(&id, Some("Mi Smart Band 7")));
        assert!(!options.accepts(&id, None));

        let all = ScanOptions::default().all_devices();
        assert!(all.accepts(&id, None));
    }

    #[test]
    fn test_accepts_identity_filter() {
        let options = ScanOptions::default().identities([DeviceIdentity::new("aa:bb")]);

        assert!(options.accepts(&"AA:BB".into(), Some("LFTB")));
        assert!(!options.accepts(&"CC:DD".into(), Some("LFTB")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer() {
        let mut debouncer = SeenDebouncer::new(Duration::from_secs(5));
        let id = DeviceIdentity::new("AA");
        let other = DeviceIdentity::new("BB");
        let start = Instant::now();

        assert!(debouncer.should_report(&id, start));
        assert!(!debouncer.should_report(&id, start + Duration::from_secs(4)));
        assert!(debouncer.should_report(&other, start + Duration::from_secs(4)));
        assert!(debouncer.should_report(&id, start + Duration::from_secs(5)));

        debouncer.reset(&id);
        assert!(debouncer.should_report(&id, start + Duration::from_secs(6)));
    }
}
