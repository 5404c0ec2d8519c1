//! SQLite-backed snapshot store for the session engine.

use async_trait::async_trait;
use laifen_core::{DeviceIdentity, Error, SnapshotStore, Telemetry};
use laifen_store::Store;
use tokio::sync::Mutex;

/// [`SnapshotStore`] over a [`laifen_store::Store`].
pub struct SqliteSnapshots {
    pub(crate) store: Mutex<Store>,
}

impl SqliteSnapshots {
    /// Wrap an opened store.
    pub fn new(store: Store) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    /// Record an advertised name for a device.
    pub async fn record_device(
        &self,
        identity: &DeviceIdentity,
        name: Option<&str>,
    ) -> laifen_store::Result<()> {
        self.store.lock().await.upsert_device(identity.as_str(), name)
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshots {
    async fn save(&self, identity: &DeviceIdentity, telemetry: &Telemetry) -> laifen_core::Result<()> {
        self.store
            .lock()
            .await
            .save_snapshot(identity.as_str(), telemetry)
            .map_err(|e| Error::persistence(e.to_string()))
    }

    async fn load(&self, identity: &DeviceIdentity) -> laifen_core::Result<Option<Telemetry>> {
        let snapshot = self
            .store
            .lock()
            .await
            .load_snapshot(identity.as_str())
            .map_err(|e| Error::persistence(e.to_string()))?;
        Ok(snapshot.map(|s| s.telemetry))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use laifen_core::{EventDispatcher, MockTransport, RunStatus, Session, SessionConfig};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn telemetry(battery: u8) -> Telemetry {
        Telemetry {
            status: RunStatus::Idle,
            mode: 1,
            vibration_strength: 2,
            oscillation_range: 1,
            oscillation_speed: 4,
            battery_level: battery,
            brushing_time_seconds: 30,
            captured_at: None,
            raw: String::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let snapshots = SqliteSnapshots::new(Store::open_in_memory().unwrap());
        let id = DeviceIdentity::new("aa:bb:cc:dd:ee:ff");

        assert!(snapshots.load(&id).await.unwrap().is_none());
        snapshots.save(&id, &telemetry(42)).await.unwrap();
        snapshots.save(&id, &telemetry(41)).await.unwrap();

        let loaded = snapshots.load(&"AA:BB:CC:DD:EE:FF".into()).await.unwrap();
        assert_eq!(loaded.unwrap().battery_level, 41);
    }

    #[tokio::test]
    async fn test_record_device_name() {
        let snapshots = SqliteSnapshots::new(Store::open_in_memory().unwrap());
        let id = DeviceIdentity::new("AA:BB");
        snapshots.record_device(&id, Some("LFTB-01")).await.unwrap();

        let device = snapshots
            .store
            .lock()
            .await
            .get_device("AA:BB")
            .unwrap()
            .unwrap();
        assert_eq!(device.name.as_deref(), Some("LFTB-01"));
    }

    #[tokio::test]
    async fn test_restart_restores_persisted_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.db");
        let id = DeviceIdentity::new("AA:BB:CC:DD:EE:FF");

        {
            let snapshots = SqliteSnapshots::new(Store::open(&path).unwrap());
            snapshots.save(&id, &telemetry(64)).await.unwrap();
        }

        let snapshots = Arc::new(SqliteSnapshots::new(Store::open(&path).unwrap()));
        let session = Session::new(
            id,
            SessionConfig::default(),
            snapshots,
            EventDispatcher::default(),
            CancellationToken::new(),
        );
        assert!(session.last_reading().is_none());
        assert_eq!(session.restore().await.unwrap().battery_level, 64);

        // Fresh readings go through the same store
        let mut frame = vec![0u8; 26];
        frame[..4].copy_from_slice(&[0xAA, 0x0A, 0x02, 0x15]);
        frame[18] = 77;
        let mock = MockTransport::builder().connected(true).frame(frame).build();
        assert!(session.bind_transport_handle(Box::new(mock)).await);
        session.shutdown().await;

        let reopened = Store::open(&path).unwrap();
        let snapshot = reopened.load_snapshot("AA:BB:CC:DD:EE:FF").unwrap().unwrap();
        assert_eq!(snapshot.telemetry.battery_level, 77);
    }
}
