//! Last-known-state cache contract.
//!
//! A session writes every valid reading through a [`SnapshotStore`] and reads
//! it back when it is created or when the device falls asleep, so the last
//! value survives restarts. The durable SQLite implementation lives in the
//! `laifen-store` crate; [`MemorySnapshotStore`] keeps entries in process.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use laifen_types::{DeviceIdentity, Telemetry};

use crate::error::Result;

/// Durable map from device identity to its last valid telemetry.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the entry for `identity`.
    async fn save(&self, identity: &DeviceIdentity, telemetry: &Telemetry) -> Result<()>;

    /// Load the entry for `identity`, if one was ever saved.
    async fn load(&self, identity: &DeviceIdentity) -> Result<Option<Telemetry>>;
}

/// In-process [`SnapshotStore`].
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<HashMap<DeviceIdentity, Telemetry>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, identity: &DeviceIdentity, telemetry: &Telemetry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(identity.clone(), telemetry.clone());
        Ok(())
    }

    async fn load(&self, identity: &DeviceIdentity) -> Result<Option<Telemetry>> {
        Ok(self.entries.read().await.get(identity).cloned())
    }
}
