//! Daemon that keeps Laifen toothbrush sessions alive.
//!
//! This crate provides a service that:
//! - Binds every configured toothbrush, or every one it sees if none are configured
//! - Rebinds devices as they wake up with fresh peripheral handles
//! - Persists the latest telemetry of each device to SQLite
//! - Logs lifecycle events (connected, asleep, ready, deferred, shutdown)
//!
//! # Configuration
//!
//! The daemon reads configuration from `~/.config/laifen/config.toml`:
//!
//! ```toml
//! [storage]
//! path = "~/.local/share/laifen/snapshots.db"
//!
//! [link]
//! connect_attempts = 10
//! connect_timeout_secs = 60
//! connect_interval_secs = 5
//!
//! [session]
//! poll_interval_secs = 1
//! setup_timeout_secs = 15
//! frame_preamble = "aa0a0215"
//!
//! [scan]
//! seen_debounce_secs = 5
//!
//! [[devices]]
//! address = "AA:BB:CC:DD:EE:FF"
//! alias = "bathroom"
//! ```
//!
//! Every key is optional.

pub mod config;
pub mod daemon;
pub mod snapshots;

pub use config::{
    Config, ConfigError, DeviceConfig, LinkSection, ScanSection, SessionSection, StorageConfig,
    ValidationError, default_config_path,
};
pub use daemon::{Daemon, Readiness, Tasks};
pub use snapshots::SqliteSnapshots;
