//! Device event system for session lifecycle and reading notifications.
//!
//! Sessions, the recovery supervisor and the presence monitor publish
//! [`DeviceEvent`]s on a broadcast channel. Collaborators that only care
//! about the latest value should prefer
//! [`Session::subscribe_readings`](crate::Session::subscribe_readings).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use laifen_types::{Command, DeviceIdentity, Telemetry};

/// Events that can be emitted for a toothbrush.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// Device was seen advertising.
    Discovered {
        device: DeviceIdentity,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// Link connected and notifications enabled.
    Connected { device: DeviceIdentity },
    /// Device dropped off the air.
    Disconnected {
        device: DeviceIdentity,
        reason: DisconnectReason,
    },
    /// New valid reading.
    Reading {
        device: DeviceIdentity,
        telemetry: Telemetry,
    },
    /// Reconnect attempts were exhausted; the device is assumed asleep.
    Asleep { device: DeviceIdentity },
    /// A valid reading arrived from a device that was asleep.
    Awake { device: DeviceIdentity },
    /// A command was written (or failed to be).
    CommandSent {
        device: DeviceIdentity,
        command: Command,
        success: bool,
    },
    /// Session was shut down.
    Terminated { device: DeviceIdentity },
}

impl DeviceEvent {
    /// Identity of the device the event is about.
    pub fn device(&self) -> &DeviceIdentity {
        match self {
            DeviceEvent::Discovered { device, .. }
            | DeviceEvent::Connected { device }
            | DeviceEvent::Disconnected { device, .. }
            | DeviceEvent::Reading { device, .. }
            | DeviceEvent::Asleep { device }
            | DeviceEvent::Awake { device }
            | DeviceEvent::CommandSent { device, .. }
            | DeviceEvent::Terminated { device } => device,
        }
    }
}

/// Reason for disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DisconnectReason {
    /// The BLE stack reported the peripheral gone.
    OutOfRange,
    /// Disconnected during shutdown.
    Shutdown,
    /// A new transport handle replaced the old one.
    Replaced,
    /// Unknown reason.
    Unknown,
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
