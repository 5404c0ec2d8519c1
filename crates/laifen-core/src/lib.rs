//! Connection and session engine for Laifen BLE toothbrushes.
//!
//! A Laifen toothbrush is only reachable while it is awake: it sleeps between
//! brushing sessions, drops its connection, and reappears with a fresh
//! peripheral handle. This crate keeps a persistent logical [`Session`] per
//! device across those gaps.
//!
//! # Features
//!
//! - **Bounded retry**: connect, subscribe and read retry in fixed batches, then
//!   give up cleanly instead of faulting the caller
//! - **Sleep detection**: exhausted reconnect batches mark a session asleep; it
//!   keeps serving the last known telemetry from memory or the snapshot store
//! - **Handle churn**: [`RecoverySupervisor`] binds the fresh transport handle
//!   of a reappearing device and tears the old one down
//! - **Push and poll**: notifications update the session without taking the
//!   link lock; [`Poller`] refreshes every session without blocking others
//! - **Presence monitoring**: [`PresenceMonitor`] watches the adapter's event
//!   stream for toothbrushes coming and going
//!
//! # Platform Differences
//!
//! On Linux and Windows devices are identified by their Bluetooth address. On
//! macOS CoreBluetooth hides the address and the peripheral UUID is used
//! instead; that UUID is stable for a device on one Mac but differs between
//! machines.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use laifen_core::{
//!     MemorySnapshotStore, PresenceMonitor, RecoverySupervisor, SessionConfig, SessionRegistry,
//!     scan,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(SessionRegistry::new(
//!         Arc::new(MemorySnapshotStore::new()),
//!         SessionConfig::default(),
//!     ));
//!     let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
//!     let cancel = CancellationToken::new();
//!
//!     let (tx, rx) = tokio::sync::mpsc::channel(32);
//!     supervisor.start(rx, cancel.clone());
//!
//!     let adapter = scan::get_adapter().await?;
//!     PresenceMonitor::new(adapter).run(tx, cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod error;
pub mod events;
pub mod link;
pub mod mock;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod scan;
pub mod session;
pub mod snapshot;
pub mod supervisor;
pub mod transport;

pub use ble::BleTransport;
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
pub use events::{DeviceEvent, DisconnectReason, EventDispatcher, EventReceiver, EventSender};
pub use link::{Link, LinkConfig};
pub use mock::{MockTransport, MockTransportBuilder};
pub use poller::Poller;
pub use registry::SessionRegistry;
pub use retry::{RetryConfig, with_retry, with_retry_cancellable};
pub use scan::{DiscoveredDevice, PresenceMonitor, ScanOptions, SeenDebouncer};
pub use session::{Session, SessionConfig, SessionState};
pub use snapshot::{MemorySnapshotStore, SnapshotStore};
pub use supervisor::{PresenceEvent, RecoverySupervisor};
pub use transport::{Notification, NotificationStream, Transport, TransportHandle};

// Re-export protocol types
pub use laifen_types::uuid as uuids;
pub use laifen_types::{
    Command, DeviceIdentity, FrameDecoder, FrameOptions, ParseError, Reading, RunStatus, Telemetry,
};
