//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use laifen_types::Telemetry;

/// Version of the JSON payload written to the `snapshots` table.
///
/// Rows written with any other version are ignored on load.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A device stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Device identifier (address or UUID).
    pub id: String,
    /// Advertised name, if it was ever seen.
    pub name: Option<String>,
    /// First time this device was seen.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// Last time this device was seen.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// The last known telemetry of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// Device identifier.
    pub device_id: String,
    /// Payload format version.
    pub format_version: u32,
    /// The persisted telemetry.
    pub telemetry: Telemetry,
    /// When the snapshot was written.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
