//! Presence-driven recovery.
//!
//! The supervisor turns "device seen" and "device lost" signals into session
//! transitions. A sleeping toothbrush reappears with a fresh transport
//! handle; binding that handle is what brings an asleep session back.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use laifen_types::DeviceIdentity;

use crate::events::{DeviceEvent, DisconnectReason};
use crate::registry::SessionRegistry;
use crate::session::SessionState;
use crate::transport::TransportHandle;

/// A presence signal for one device.
pub enum PresenceEvent {
    /// The device advertised; `handle` can be used to connect to it.
    Seen {
        identity: DeviceIdentity,
        name: Option<String>,
        handle: TransportHandle,
    },
    /// The BLE stack reported the device gone.
    Lost { identity: DeviceIdentity },
}

impl PresenceEvent {
    /// Identity of the device the signal is about.
    pub fn identity(&self) -> &DeviceIdentity {
        match self {
            PresenceEvent::Seen { identity, .. } | PresenceEvent::Lost { identity } => identity,
        }
    }
}

impl std::fmt::Debug for PresenceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceEvent::Seen { identity, name, .. } => f
                .debug_struct("Seen")
                .field("identity", identity)
                .field("name", name)
                .finish_non_exhaustive(),
            PresenceEvent::Lost { identity } => {
                f.debug_struct("Lost").field("identity", identity).finish()
            }
        }
    }
}

/// Binds fresh transport handles to sessions that need them.
#[derive(Debug)]
pub struct RecoverySupervisor {
    registry: Arc<SessionRegistry>,
    in_flight: Mutex<HashSet<DeviceIdentity>>,
}

/// Clears an identity from the in-flight set when the bind ends.
struct BindGuard<'a> {
    in_flight: &'a Mutex<HashSet<DeviceIdentity>>,
    identity: DeviceIdentity,
}

impl Drop for BindGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.identity);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecoverySupervisor {
    /// Create a supervisor over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Handle a presence signal carrying a fresh transport handle.
    ///
    /// Creates the session if this is the first sighting, then binds the
    /// handle unless the current transport reports the link up. The check
    /// waits for any poll or command holding the link. Returns `true` if a
    /// bind ran and succeeded.
    pub async fn on_device_seen(&self, identity: DeviceIdentity, handle: TransportHandle) -> bool {
        let session = match self.registry.get(&identity).await {
            Some(session) => session,
            None => {
                let name = handle.name().map(str::to_string);
                let session = self.registry.get_or_create(&identity).await;
                self.registry.events().send(DeviceEvent::Discovered {
                    device: identity.clone(),
                    name,
                    rssi: None,
                });
                session
            }
        };

        if session.state() == SessionState::Terminated {
            return false;
        }

        let Some(_guard) = self.begin_bind(&identity) else {
            debug!(device = %identity, "Bind already in flight, dropping handle");
            return false;
        };

        if session.is_connected().await {
            debug!(device = %identity, "Link still up, keeping current handle");
            return false;
        }

        session.bind_transport_handle(handle).await
    }

    /// Handle a "device gone" signal.
    ///
    /// Only flags the session; the next sighting decides what to do.
    pub async fn on_device_lost(&self, identity: &DeviceIdentity) {
        let Some(session) = self.registry.get(identity).await else {
            debug!(device = %identity, "Lost signal for unknown device");
            return;
        };
        session.mark_reconnect_eligible();
        info!(device = %identity, "Device lost");
        self.registry.events().send(DeviceEvent::Disconnected {
            device: identity.clone(),
            reason: DisconnectReason::OutOfRange,
        });
    }

    /// Consume presence signals until `cancel` fires or the sender closes.
    ///
    /// Binds run in their own tasks so one device's reconnect batch never
    /// delays another's.
    pub fn start(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<PresenceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Recovery supervisor cancelled, shutting down");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(PresenceEvent::Seen { identity, handle, .. }) => {
                            let supervisor = Arc::clone(&supervisor);
                            tokio::spawn(async move {
                                supervisor.on_device_seen(identity, handle).await;
                            });
                        }
                        Some(PresenceEvent::Lost { identity }) => {
                            supervisor.on_device_lost(&identity).await;
                        }
                        None => {
                            debug!("Presence channel closed");
                            break;
                        }
                    },
                }
            }
        })
    }

    fn begin_bind(&self, identity: &DeviceIdentity) -> Option<BindGuard<'_>> {
        if !lock(&self.in_flight).insert(identity.clone()) {
            return None;
        }
        Some(BindGuard {
            in_flight: &self.in_flight,
            identity: identity.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::mock::MockTransport;
    use crate::retry::RetryConfig;
    use crate::session::SessionConfig;
    use crate::snapshot::MemorySnapshotStore;
    use std::time::Duration;

    fn frame() -> Vec<u8> {
        let mut frame = vec![0u8; 26];
        frame[..4].copy_from_slice(&[0xAA, 0x0A, 0x02, 0x15]);
        frame[18] = 0x50;
        frame
    }

    fn registry() -> Arc<SessionRegistry> {
        let config = SessionConfig::default()
            .link(LinkConfig::default().connect_retry(RetryConfig::fixed(2, Duration::from_secs(1))))
            .poll_reconnect(RetryConfig::fixed(2, Duration::from_secs(1)));
        Arc::new(SessionRegistry::new(
            Arc::new(MemorySnapshotStore::new()),
            config,
        ))
    }

    fn device() -> MockTransport {
        MockTransport::builder().frame(frame()).build()
    }

    #[tokio::test]
    async fn test_seen_creates_and_binds() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        let mut events = registry.events().subscribe();

        assert!(supervisor.on_device_seen("aa:bb".into(), Box::new(device())).await);

        let session = registry.get(&"AA:BB".into()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(matches!(
            events.recv().await.unwrap(),
            DeviceEvent::Discovered { .. }
        ));
    }

    #[tokio::test]
    async fn test_seen_while_connected_is_noop() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        let first = device();
        assert!(supervisor.on_device_seen("AA".into(), Box::new(first.clone())).await);

        let second = device();
        assert!(!supervisor.on_device_seen("AA".into(), Box::new(second.clone())).await);
        assert_eq!(second.connect_calls(), 0);
        assert_eq!(second.handle_count(), 1);
        assert!(first.is_connected_now());
    }

    #[tokio::test]
    async fn test_lost_then_seen_rebinds() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        let first = device();
        assert!(supervisor.on_device_seen("AA".into(), Box::new(first.clone())).await);

        // Still connected: a lost signal alone does not rebind
        supervisor.on_device_lost(&"AA".into()).await;
        assert!(!supervisor.on_device_seen("AA".into(), Box::new(device())).await);

        first.drop_link();
        supervisor.on_device_lost(&"AA".into()).await;
        let second = device();
        assert!(supervisor.on_device_seen("AA".into(), Box::new(second.clone())).await);
        assert!(second.is_connected_now());
        assert_eq!(first.handle_count(), 1);

        let session = registry.get(&"AA".into()).await.unwrap();
        assert!(!session.is_reconnect_eligible());
    }

    #[tokio::test]
    async fn test_silent_link_drop_then_seen_rebinds() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        let first = device();
        assert!(supervisor.on_device_seen("AA".into(), Box::new(first.clone())).await);

        // No lost signal: the state still says connected
        first.drop_link();
        let session = registry.get(&"AA".into()).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let fresh = device();
        assert!(supervisor.on_device_seen("AA".into(), Box::new(fresh.clone())).await);
        assert!(fresh.is_connected_now());
        assert_eq!(fresh.connect_calls(), 1);
        assert_eq!(first.handle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seen_waits_for_busy_link() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        let first = device();
        assert!(supervisor.on_device_seen("AA".into(), Box::new(first.clone())).await);
        let session = registry.get(&"AA".into()).await.unwrap();

        // A poll holds the link through a slow read, then finds it gone
        first.set_read_latency(Duration::from_secs(5));
        let poll = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.poll_once().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.drop_link();

        let fresh = device();
        assert!(supervisor.on_device_seen("AA".into(), Box::new(fresh.clone())).await);
        assert!(fresh.is_connected_now());
        assert_eq!(session.state(), SessionState::Connected);
        poll.await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_unknown_device_is_ignored() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        supervisor.on_device_lost(&"FF".into()).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_seen_during_bind_is_dropped() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        let slow = MockTransport::builder()
            .frame(frame())
            .connect_latency(Duration::from_secs(2))
            .build();
        let duplicate = device();

        let (first, second) = tokio::join!(
            supervisor.on_device_seen("AA".into(), Box::new(slow.clone())),
            supervisor.on_device_seen("AA".into(), Box::new(duplicate.clone())),
        );

        assert!(first);
        assert!(!second);
        assert_eq!(duplicate.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_event_loop() {
        let registry = registry();
        let supervisor = RecoverySupervisor::new(Arc::clone(&registry));
        let session = registry.get_or_create(&"AA".into()).await;
        let mut events = registry.events().subscribe();

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = supervisor.start(rx, cancel.clone());

        tx.send(PresenceEvent::Seen {
            identity: "AA".into(),
            name: Some("LFTB-1".into()),
            handle: Box::new(device()),
        })
        .await
        .unwrap();
        assert!(session.wait_until_connected(Duration::from_secs(5)).await);

        tx.send(PresenceEvent::Lost {
            identity: "AA".into(),
        })
        .await
        .unwrap();
        loop {
            if let DeviceEvent::Disconnected { reason, .. } = events.recv().await.unwrap() {
                assert_eq!(reason, DisconnectReason::OutOfRange);
                break;
            }
        }
        assert!(session.is_reconnect_eligible());

        cancel.cancel();
        handle.await.unwrap();
    }
}
