//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use laifen_types::Telemetry;

use crate::error::{Error, Result};
use crate::models::{SNAPSHOT_FORMAT_VERSION, StoredDevice, StoredSnapshot};
use crate::schema;

/// SQLite-based store for toothbrush snapshots.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening snapshot database at {}", path.display());
        let conn = Connection::open(path)?;

        // WAL keeps readers off the writer and makes each commit atomic on crash
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // === Device operations ===

    /// Record that a device was seen, creating it if needed.
    pub fn upsert_device(&self, device_id: &str, name: Option<&str>) -> Result<()> {
        upsert_device(&self.conn, device_id, name, now())
    }

    /// Get a device by ID.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, first_seen, last_seen FROM devices WHERE id = ?",
                [device_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, name, first, last)| device_from_row(id, name, first, last))
            .transpose()
    }

    /// List all devices, most recently seen first.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, first_seen, last_seen FROM devices ORDER BY last_seen DESC, id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, first, last)| device_from_row(id, name, first, last))
            .collect()
    }

    // === Snapshot operations ===

    /// Persist the latest telemetry for a device, replacing any previous snapshot.
    ///
    /// The device row and the snapshot row are written in one transaction.
    pub fn save_snapshot(&self, device_id: &str, telemetry: &Telemetry) -> Result<()> {
        let payload = serde_json::to_string(telemetry)?;
        let now = now();

        let tx = self.conn.unchecked_transaction()?;
        upsert_device(&tx, device_id, None, now)?;
        tx.execute(
            "INSERT INTO snapshots (device_id, format_version, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                format_version = ?2,
                payload = ?3,
                updated_at = ?4",
            rusqlite::params![device_id, SNAPSHOT_FORMAT_VERSION, payload, now],
        )?;
        tx.commit()?;

        debug!(device = device_id, "Saved snapshot");
        Ok(())
    }

    /// Load the snapshot for a device.
    ///
    /// Returns `Ok(None)` if the device has no snapshot or if the stored
    /// payload was written with an unsupported format version.
    pub fn load_snapshot(&self, device_id: &str) -> Result<Option<StoredSnapshot>> {
        let row = self
            .conn
            .query_row(
                "SELECT device_id, format_version, payload, updated_at
                 FROM snapshots WHERE device_id = ?",
                [device_id],
                snapshot_row,
            )
            .optional()?;

        match row {
            Some(row) => row.into_snapshot(),
            None => Ok(None),
        }
    }

    /// List every readable snapshot.
    ///
    /// Rows that cannot be decoded are skipped with a warning.
    pub fn list_snapshots(&self) -> Result<Vec<StoredSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, format_version, payload, updated_at
             FROM snapshots ORDER BY device_id",
        )?;

        let rows = stmt
            .query_map([], snapshot_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let device_id = row.device_id.clone();
            match row.into_snapshot() {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(e) => warn!(device = %device_id, error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(snapshots)
    }

    /// Delete the snapshot for a device. Returns `true` if one existed.
    pub fn delete_snapshot(&self, device_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM snapshots WHERE device_id = ?", [device_id])?;
        Ok(deleted > 0)
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn upsert_device(conn: &Connection, device_id: &str, name: Option<&str>, at: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO devices (id, name, first_seen, last_seen) VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(id) DO UPDATE SET
            name = COALESCE(?2, name),
            last_seen = ?3",
        rusqlite::params![device_id, name, at],
    )?;
    Ok(())
}

fn timestamp(secs: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|_| Error::InvalidTimestamp(secs))
}

fn device_from_row(
    id: String,
    name: Option<String>,
    first_seen: i64,
    last_seen: i64,
) -> Result<StoredDevice> {
    Ok(StoredDevice {
        id,
        name,
        first_seen: timestamp(first_seen)?,
        last_seen: timestamp(last_seen)?,
    })
}

/// Raw snapshot row before the payload is decoded.
struct SnapshotRow {
    device_id: String,
    format_version: u32,
    payload: String,
    updated_at: i64,
}

fn snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        device_id: row.get(0)?,
        format_version: row.get(1)?,
        payload: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Option<StoredSnapshot>> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            warn!(
                device = %self.device_id,
                version = self.format_version,
                "Ignoring snapshot with unsupported format version"
            );
            return Ok(None);
        }

        let telemetry: Telemetry = serde_json::from_str(&self.payload)?;
        Ok(Some(StoredSnapshot {
            device_id: self.device_id,
            format_version: self.format_version,
            telemetry,
            updated_at: timestamp(self.updated_at)?,
        }))
    }
}
