//! btleplug-backed [`Transport`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{BDAddr, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use laifen_types::DeviceIdentity;

use crate::error::{Error, Result};
use crate::transport::{Notification, NotificationStream, Transport};

/// Default timeout for service discovery after a connection is opened.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Format a peripheral ID as a plain string.
///
/// btleplug only exposes the ID through `Debug`, which wraps it in
/// `PeripheralId(...)`.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Identity for a peripheral.
///
/// CoreBluetooth reports every address as `00:00:00:00:00:00`, so macOS falls
/// back to the peripheral UUID.
pub fn peripheral_identity(address: BDAddr, id: &PeripheralId) -> DeviceIdentity {
    let address = address.to_string();
    if address == "00:00:00:00:00:00" {
        DeviceIdentity::new(format_peripheral_id(id))
    } else {
        DeviceIdentity::new(address)
    }
}

/// A toothbrush reachable through the system Bluetooth stack.
///
/// Connecting discovers services and caches characteristics; the cache is
/// dropped on disconnect because handles may change after the device reboots.
pub struct BleTransport {
    /// Keeps the adapter alive for the lifetime of the peripheral.
    #[allow(dead_code)]
    adapter: Adapter,
    peripheral: Peripheral,
    name: Option<String>,
    address: String,
    discovery_timeout: Duration,
    characteristics: RwLock<HashMap<Uuid, Characteristic>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BleTransport {
    /// Wrap a discovered peripheral, reading its address and name.
    pub async fn new(adapter: Adapter, peripheral: Peripheral) -> Result<Self> {
        let properties = peripheral.properties().await?;
        let name = properties.as_ref().and_then(|p| p.local_name.clone());
        let identity = properties
            .as_ref()
            .map(|p| peripheral_identity(p.address, &peripheral.id()))
            .unwrap_or_else(|| DeviceIdentity::new(format_peripheral_id(&peripheral.id())));

        Ok(Self::from_parts(adapter, peripheral, identity, name))
    }

    /// Wrap a peripheral whose identity is already known.
    pub fn from_parts(
        adapter: Adapter,
        peripheral: Peripheral,
        identity: DeviceIdentity,
        name: Option<String>,
    ) -> Self {
        Self {
            adapter,
            peripheral,
            name,
            address: identity.as_str().to_string(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            characteristics: RwLock::new(HashMap::new()),
        }
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// The underlying btleplug peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    async fn cache_characteristics(&self) {
        let services = self.peripheral.services();
        let mut cache = self.characteristics.write().await;
        cache.clear();
        for service in &services {
            for characteristic in &service.characteristics {
                cache.insert(characteristic.uuid, characteristic.clone());
            }
        }
        debug!(
            device = %self.address,
            services = services.len(),
            characteristics = cache.len(),
            "Cached characteristics"
        );
    }

    async fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        if let Some(characteristic) = self.characteristics.read().await.get(&uuid) {
            return Ok(characteristic.clone());
        }

        // Cache is empty when the stack reconnected on its own
        self.peripheral
            .services()
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| {
                Error::characteristic_not_found(uuid.to_string(), self.peripheral.services().len())
            })
    }
}

/// BlueZ and WinRT report a repeated subscribe as an error string.
fn is_already_subscribed(error: &btleplug::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("already enabled") || message.contains("already subscribed")
}

#[async_trait]
impl Transport for BleTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;

        timeout(self.discovery_timeout, self.peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", self.discovery_timeout))??;

        self.cache_characteristics().await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.characteristics.write().await.clear();
        if !self.is_connected().await {
            return Ok(());
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.find_characteristic(characteristic).await?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.find_characteristic(characteristic).await?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await
            .map_err(|e| Error::write_failed(characteristic.uuid.to_string(), e.to_string()))
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.find_characteristic(characteristic).await?;
        match self.peripheral.subscribe(&characteristic).await {
            Ok(()) => Ok(()),
            Err(e) if is_already_subscribed(&e) => Err(Error::AlreadySubscribed),
            Err(e) => Err(e.into()),
        }
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.find_characteristic(characteristic).await?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let stream = self.peripheral.notifications().await?;
        Ok(Box::pin(stream.map(|n| Notification {
            characteristic: n.uuid,
            value: n.value,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_subscribed_detection() {
        let err = btleplug::Error::Other("Notifications are already enabled".into());
        assert!(is_already_subscribed(&err));

        let err = btleplug::Error::NotConnected;
        assert!(!is_already_subscribed(&err));
    }
}
