//! Durable last-known-state snapshots for Laifen toothbrushes.
//!
//! A toothbrush sleeps most of the day. This crate keeps the latest decoded
//! [`Telemetry`](laifen_types::Telemetry) for every device in SQLite so a
//! restart or a long sleep does not present blank state.
//!
//! Each device has exactly one snapshot row holding a versioned JSON payload.
//! Writes are single-row upserts inside a transaction, so a crash mid-write
//! never touches the rows of other devices.
//!
//! # Example
//!
//! ```no_run
//! use laifen_store::Store;
//!
//! let store = Store::open_default()?;
//! if let Some(snapshot) = store.load_snapshot("AA:BB:CC:DD:EE:FF")? {
//!     println!("battery {}%", snapshot.telemetry.battery_level);
//! }
//! # Ok::<(), laifen_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{SNAPSHOT_FORMAT_VERSION, StoredDevice, StoredSnapshot};
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/laifen/snapshots.db`
/// - macOS: `~/Library/Application Support/laifen/snapshots.db`
/// - Windows: `C:\Users\<user>\AppData\Local\laifen\snapshots.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("laifen")
        .join("snapshots.db")
}
