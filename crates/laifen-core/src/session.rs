//! Per-device session state machine.
//!
//! A [`Session`] is the long-lived logical view of one toothbrush. It outlives
//! any single connection: transport handles come and go as the device sleeps
//! and wakes, while the session keeps the last valid telemetry and reconciles
//! it with the [`SnapshotStore`].
//!
//! ```text
//! Unbound ──bind──▶ Connecting ──ok──▶ Connected ◀──reading── Asleep
//!                      │                   │                    ▲
//!                      │                   └──reconnect fails───┤
//!                      └──────────────bind fails────────────────┘
//! any ──shutdown──▶ Terminated
//! ```
//!
//! Link operations are serialized by one async mutex. Notifications bypass
//! it: the link forwards them into a channel drained by the session's own
//! task, and the latest reading is published with a single `watch` replace.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use laifen_types::{Command, DeviceIdentity, FrameDecoder, FrameOptions, Reading, Telemetry};

use crate::events::{DeviceEvent, EventDispatcher};
use crate::link::{Link, LinkConfig};
use crate::retry::RetryConfig;
use crate::snapshot::SnapshotStore;
use crate::transport::TransportHandle;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport handle has been bound yet.
    Unbound,
    /// A bind is connecting and subscribing.
    Connecting,
    /// Connected and subscribed.
    Connected,
    /// Reconnect attempts were exhausted; the last reading is served from cache.
    Asleep,
    /// Shut down. Terminal.
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unbound => write!(f, "unbound"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Asleep => write!(f, "asleep"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Session behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Settings for every link the session creates.
    pub link: LinkConfig,
    /// Reconnect batch used when a poll finds the link down.
    pub poll_reconnect: RetryConfig,
    /// Frame validation rules.
    pub frame: FrameOptions,
    /// Drop the first notification after each successful subscription.
    pub discard_first_notification: bool,
    /// Capacity of the notification channel.
    pub notification_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            poll_reconnect: RetryConfig::for_reconnect(),
            frame: FrameOptions::default(),
            discard_first_notification: false,
            notification_buffer: 16,
        }
    }
}

impl SessionConfig {
    /// Set the link configuration.
    #[must_use]
    pub fn link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Set the poll reconnect batch.
    #[must_use]
    pub fn poll_reconnect(mut self, retry: RetryConfig) -> Self {
        self.poll_reconnect = retry;
        self
    }

    /// Set the frame validation rules.
    #[must_use]
    pub fn frame(mut self, frame: FrameOptions) -> Self {
        self.frame = frame;
        self
    }

    /// Enable or disable first-notification discard.
    #[must_use]
    pub fn discard_first_notification(mut self, discard: bool) -> Self {
        self.discard_first_notification = discard;
        self
    }
}

/// Logical session with one toothbrush.
pub struct Session {
    identity: DeviceIdentity,
    config: SessionConfig,
    decoder: FrameDecoder,
    link: Mutex<Option<Link>>,
    state: watch::Sender<SessionState>,
    reading: watch::Sender<Option<Telemetry>>,
    store: Arc<dyn SnapshotStore>,
    events: EventDispatcher,
    cancel: CancellationToken,
    notify_tx: mpsc::Sender<Vec<u8>>,
    drain: OnceLock<JoinHandle<()>>,
    skip_next_notification: AtomicBool,
    reconnect_eligible: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create an unbound session and start its notification drain task.
    ///
    /// Must be called within a Tokio runtime. `cancel` interrupts every retry
    /// loop the session runs; pass a child of the process-wide token.
    pub fn new(
        identity: DeviceIdentity,
        config: SessionConfig,
        store: Arc<dyn SnapshotStore>,
        events: EventDispatcher,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_buffer.max(1));
        let (state, _) = watch::channel(SessionState::Unbound);
        let (reading, _) = watch::channel(None);

        let session = Arc::new(Self {
            identity,
            decoder: FrameDecoder::new(config.frame.clone()),
            config,
            link: Mutex::new(None),
            state,
            reading,
            store,
            events,
            cancel,
            notify_tx,
            drain: OnceLock::new(),
            skip_next_notification: AtomicBool::new(false),
            reconnect_eligible: AtomicBool::new(false),
        });

        let handle = tokio::spawn(drain_notifications(
            Arc::downgrade(&session),
            notify_rx,
            session.cancel.clone(),
        ));
        let _ = session.drain.set(handle);
        session
    }

    /// Device this session belongs to.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Configuration in use.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether reconnect attempts were exhausted.
    pub fn is_asleep(&self) -> bool {
        self.state() == SessionState::Asleep
    }

    /// Last valid telemetry, if any was ever obtained.
    pub fn last_reading(&self) -> Option<Telemetry> {
        self.reading.borrow().clone()
    }

    /// Watch reading changes.
    pub fn subscribe_readings(&self) -> watch::Receiver<Option<Telemetry>> {
        self.reading.subscribe()
    }

    /// Ask the transport whether the link is up.
    ///
    /// Waits for any operation holding the link to finish first.
    pub async fn is_connected(&self) -> bool {
        match self.link.lock().await.as_ref() {
            Some(link) => link.is_connected().await,
            None => false,
        }
    }

    /// Record that the BLE stack reported the device gone.
    pub fn mark_reconnect_eligible(&self) {
        self.reconnect_eligible.store(true, Ordering::SeqCst);
    }

    /// Whether a loss was reported since the last successful bind.
    pub fn is_reconnect_eligible(&self) -> bool {
        self.reconnect_eligible.load(Ordering::SeqCst)
    }

    /// Load the persisted snapshot if nothing is cached in memory.
    pub async fn restore(&self) -> Option<Telemetry> {
        if let Some(reading) = self.last_reading() {
            return Some(reading);
        }
        match self.store.load(&self.identity).await {
            Ok(Some(telemetry)) => {
                debug!(device = %self.identity, "Restored snapshot");
                self.reading.send_replace(Some(telemetry.clone()));
                Some(telemetry)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(device = %self.identity, error = %e, "Failed to load snapshot");
                None
            }
        }
    }

    /// Wait until the session is connected.
    ///
    /// Returns `false` on timeout or if the session terminates first.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let wait = rx.wait_for(|s| matches!(s, SessionState::Connected | SessionState::Terminated));
        let settled = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        settled && self.state() == SessionState::Connected
    }

    /// Refresh the reading and return the last known telemetry.
    ///
    /// Never blocks behind a bind or command: if the link is busy the cached
    /// value is returned as is. Asleep sessions do no radio work and answer
    /// from memory or the snapshot store.
    pub async fn poll_once(&self) -> Option<Telemetry> {
        match self.state() {
            SessionState::Terminated => return self.last_reading(),
            SessionState::Asleep => return self.restore().await,
            _ => {}
        }

        let Ok(mut guard) = self.link.try_lock() else {
            debug!(device = %self.identity, "Link busy, serving cached reading");
            return self.last_reading();
        };
        let Some(link) = guard.as_mut() else {
            return self.last_reading();
        };

        if !link.is_connected().await && !self.reconnect(link).await {
            drop(guard);
            self.enter_asleep();
            return self.restore().await;
        }

        match link.read_current_frame().await {
            Some(frame) => self.handle_frame(&frame).await,
            None => debug!(device = %self.identity, "No frame available"),
        }
        self.last_reading()
    }

    /// Apply a pushed frame.
    ///
    /// Invalid frames are logged and dropped; the previous reading stays.
    pub async fn on_notification(&self, frame: &[u8]) {
        if self.state() == SessionState::Terminated {
            return;
        }
        if self.skip_next_notification.swap(false, Ordering::SeqCst) {
            debug!(device = %self.identity, "Discarding first notification");
            return;
        }
        self.handle_frame(frame).await;
    }

    /// Replace the transport handle and connect with it.
    ///
    /// The previous link, if any, is disconnected first. If the connect or
    /// subscribe batch is exhausted the device is classified asleep and the
    /// last reading is backfilled from the store. The new link is kept so a
    /// command can still try it.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.identity))]
    pub async fn bind_transport_handle(&self, handle: TransportHandle) -> bool {
        if self.state() == SessionState::Terminated {
            return false;
        }

        let mut guard = self.link.lock().await;
        if self.state() == SessionState::Terminated {
            return false;
        }
        if let Some(old) = guard.take() {
            debug!(device = %self.identity, "Replacing transport handle");
            old.disconnect().await;
        }

        let previous = self.state.send_replace(SessionState::Connecting);
        let link = guard.insert(
            Link::new(self.identity.clone(), handle, self.config.link.clone())
                .with_cancel_token(self.cancel.clone()),
        );
        let bound = link.connect().await && self.subscribe(link).await;

        if bound {
            self.reconnect_eligible.store(false, Ordering::SeqCst);
            self.state.send_replace(SessionState::Connected);
            info!(device = %self.identity, "Session connected");
            self.events.send(DeviceEvent::Connected {
                device: self.identity.clone(),
            });
        } else if self.cancel.is_cancelled() {
            self.state.send_replace(previous);
        } else {
            warn!(device = %self.identity, "Bind failed, will retry on next presence signal");
            self.enter_asleep();
        }
        drop(guard);

        if bound {
            self.poll_once().await;
        } else {
            self.restore().await;
        }
        bound
    }

    /// Write a command to the device.
    pub async fn send_command(&self, command: Command) -> bool {
        if self.state() == SessionState::Terminated {
            return false;
        }

        let (success, unreachable) = {
            let mut guard = self.link.lock().await;
            match guard.as_mut() {
                Some(link) => {
                    let sent = link.send(&command.encode()).await;
                    let lost = !sent && !self.cancel.is_cancelled() && !link.is_connected().await;
                    (sent, lost)
                }
                None => {
                    debug!(device = %self.identity, "No transport bound");
                    (false, false)
                }
            }
        };

        if success {
            info!(device = %self.identity, %command, "Command sent");
        } else {
            warn!(device = %self.identity, %command, "Command failed");
        }
        if unreachable {
            self.enter_asleep();
            self.restore().await;
        }
        self.events.send(DeviceEvent::CommandSent {
            device: self.identity.clone(),
            command,
            success,
        });
        success
    }

    /// Tear down the link and terminate. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        {
            let mut guard = self.link.lock().await;
            if let Some(mut link) = guard.take() {
                link.unsubscribe_notifications().await;
                link.disconnect().await;
            }
        }

        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Terminated {
                false
            } else {
                *state = SessionState::Terminated;
                true
            }
        });
        if let Some(drain) = self.drain.get() {
            drain.abort();
        }

        if changed {
            info!(device = %self.identity, "Session terminated");
            self.events.send(DeviceEvent::Terminated {
                device: self.identity.clone(),
            });
        }
    }

    async fn reconnect(&self, link: &mut Link) -> bool {
        debug!(device = %self.identity, "Link down, reconnecting");
        if !link.connect_with(&self.config.poll_reconnect).await {
            return false;
        }
        if !self.subscribe(link).await {
            return false;
        }
        self.state.send_replace(SessionState::Connected);
        true
    }

    /// Subscribe with the discard flag armed before the forwarder can deliver.
    async fn subscribe(&self, link: &mut Link) -> bool {
        self.arm_first_notification_discard();
        let subscribed = link.subscribe_notifications(self.notify_tx.clone()).await;
        if !subscribed {
            self.skip_next_notification.store(false, Ordering::SeqCst);
        }
        subscribed
    }

    fn enter_asleep(&self) {
        let changed = self.state.send_if_modified(|state| match state {
            SessionState::Asleep | SessionState::Terminated => false,
            _ => {
                *state = SessionState::Asleep;
                true
            }
        });
        if changed {
            info!(device = %self.identity, "Device asleep");
            self.events.send(DeviceEvent::Asleep {
                device: self.identity.clone(),
            });
        }
    }

    fn arm_first_notification_discard(&self) {
        if self.config.discard_first_notification {
            self.skip_next_notification.store(true, Ordering::SeqCst);
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        match self.decoder.decode(frame) {
            Reading::Valid(telemetry) => {
                self.apply_reading(telemetry.with_captured_at(OffsetDateTime::now_utc()))
                    .await;
            }
            Reading::Unknown { raw, reason } => {
                debug!(device = %self.identity, %raw, %reason, "Discarding unparseable frame");
            }
        }
    }

    async fn apply_reading(&self, telemetry: Telemetry) {
        self.reading.send_replace(Some(telemetry.clone()));

        if let Err(e) = self.store.save(&self.identity, &telemetry).await {
            warn!(device = %self.identity, error = %e, "Failed to persist snapshot");
        }

        let woke = self.state.send_if_modified(|state| {
            if *state == SessionState::Asleep {
                *state = SessionState::Connected;
                true
            } else {
                false
            }
        });
        if woke {
            info!(device = %self.identity, "Device awake");
            self.events.send(DeviceEvent::Awake {
                device: self.identity.clone(),
            });
        }

        self.events.send(DeviceEvent::Reading {
            device: self.identity.clone(),
            telemetry,
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.get() {
            drain.abort();
        }
    }
}

async fn drain_notifications(
    session: Weak<Session>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        session.on_notification(&frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::mock::MockTransport;
    use crate::snapshot::MemorySnapshotStore;
    use async_trait::async_trait;
    use laifen_types::RunStatus;

    fn frame(battery: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 26];
        frame[..4].copy_from_slice(&[0xAA, 0x0A, 0x02, 0x15]);
        frame[5] = 0x03;
        frame[6] = 0x02;
        frame[7] = 0x01;
        frame[18] = battery;
        frame[21] = 0x3C;
        frame[23] = 0x01;
        frame
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .link(
                LinkConfig::default()
                    .connect_retry(RetryConfig::fixed(2, Duration::from_secs(1)))
                    .subscribe_retry(RetryConfig::fixed(2, Duration::from_secs(1))),
            )
            .poll_reconnect(RetryConfig::fixed(2, Duration::from_secs(1)))
    }

    fn session_with(config: SessionConfig, store: Arc<dyn SnapshotStore>) -> Arc<Session> {
        Session::new(
            DeviceIdentity::new("AA:BB:CC:DD:EE:FF"),
            config,
            store,
            EventDispatcher::default(),
            CancellationToken::new(),
        )
    }

    fn session() -> Arc<Session> {
        session_with(fast_config(), Arc::new(MemorySnapshotStore::new()))
    }

    struct FailingStore;

    #[async_trait]
    impl SnapshotStore for FailingStore {
        async fn save(&self, _: &DeviceIdentity, _: &Telemetry) -> Result<()> {
            Err(Error::persistence("disk full"))
        }

        async fn load(&self, _: &DeviceIdentity) -> Result<Option<Telemetry>> {
            Err(Error::persistence("disk full"))
        }
    }

    #[tokio::test]
    async fn test_new_session_is_unbound() {
        let session = session();
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(session.last_reading().is_none());
        assert!(!session.is_connected().await);
        assert!(session.poll_once().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_connects_and_polls() {
        let session = session();
        let mock = MockTransport::builder().frame(frame(80)).build();

        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(mock.is_subscribed_now());

        let reading = session.last_reading().unwrap();
        assert_eq!(reading.battery_level, 80);
        assert_eq!(reading.status, RunStatus::Running);
        assert!(reading.captured_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bind_enters_asleep() {
        let session = session();
        let mock = MockTransport::builder().unreachable().build();

        assert!(!session.bind_transport_handle(Box::new(mock.clone())).await);
        assert_eq!(session.state(), SessionState::Asleep);
        assert_eq!(mock.connect_calls(), 2);
        // The handle is kept for commands
        assert_eq!(mock.handle_count(), 2);

        // No second batch from the poll
        session.poll_once().await;
        assert_eq!(mock.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bind_backfills_from_store() {
        let store = Arc::new(MemorySnapshotStore::new());
        let identity = DeviceIdentity::new("AA:BB:CC:DD:EE:FF");
        let telemetry = FrameDecoder::default().try_decode(&frame(37)).unwrap();
        store.save(&identity, &telemetry).await.unwrap();

        let session = session_with(fast_config(), store);
        let mock = MockTransport::builder().unreachable().build();
        assert!(!session.bind_transport_handle(Box::new(mock)).await);

        assert!(session.is_asleep());
        assert_eq!(session.last_reading().unwrap().battery_level, 37);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscribe_enters_asleep() {
        let session = session();
        let mock = MockTransport::builder().subscribe_failures(10).build();

        assert!(!session.bind_transport_handle(Box::new(mock.clone())).await);
        assert!(session.is_asleep());
        assert_eq!(mock.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_bind_keeps_state() {
        let session = session();
        session.cancel.cancel();
        let mock = MockTransport::builder().build();

        assert!(!session.bind_transport_handle(Box::new(mock.clone())).await);
        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(mock.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_rebind_wakes_asleep_session() {
        let session = session();
        session.enter_asleep();

        let mock = MockTransport::builder().frame(frame(45)).build();
        assert!(session.bind_transport_handle(Box::new(mock)).await);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.last_reading().unwrap().battery_level, 45);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rebind_stays_asleep() {
        let session = session();
        let first = MockTransport::builder().frame(frame(45)).build();
        assert!(session.bind_transport_handle(Box::new(first.clone())).await);
        first.drop_link();
        first.set_connect_always_fails(true);
        session.poll_once().await;
        assert!(session.is_asleep());

        let second = MockTransport::builder().unreachable().build();
        assert!(!session.bind_transport_handle(Box::new(second.clone())).await);
        assert!(session.is_asleep());
        assert_eq!(second.connect_calls(), 2);
        assert_eq!(first.handle_count(), 1);
        assert_eq!(session.last_reading().unwrap().battery_level, 45);
    }

    #[tokio::test]
    async fn test_rebind_tears_down_old_handle() {
        let session = session();
        let first = MockTransport::builder().frame(frame(80)).build();
        let second = MockTransport::builder().frame(frame(70)).build();

        assert!(session.bind_transport_handle(Box::new(first.clone())).await);
        assert!(session.bind_transport_handle(Box::new(second.clone())).await);

        assert_eq!(first.disconnect_calls(), 1);
        assert_eq!(first.handle_count(), 1);
        assert!(!first.is_connected_now());
        assert_eq!(session.last_reading().unwrap().battery_level, 70);
    }

    #[tokio::test]
    async fn test_notification_updates_reading() {
        let session = session();
        let mock = MockTransport::builder().frame(frame(1)).build();
        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);

        let mut readings = session.subscribe_readings();
        assert!(mock.push_notification(&frame(42)));
        readings.changed().await.unwrap();

        assert_eq!(session.last_reading().unwrap().battery_level, 42);
    }

    #[tokio::test]
    async fn test_bad_notification_keeps_previous_reading() {
        let session = session();
        session.on_notification(&frame(55)).await;
        session.on_notification(&[0x00, 0x01, 0x02]).await;
        session.on_notification(&frame(55)[..10]).await;

        assert_eq!(session.last_reading().unwrap().battery_level, 55);
    }

    #[tokio::test]
    async fn test_first_notification_discard() {
        let session = session_with(
            fast_config().discard_first_notification(true),
            Arc::new(MemorySnapshotStore::new()),
        );
        let mock = MockTransport::builder().frame(frame(5)).build();
        assert!(session.bind_transport_handle(Box::new(mock)).await);

        session.on_notification(&frame(10)).await;
        assert_eq!(session.last_reading().unwrap().battery_level, 5);

        session.on_notification(&frame(20)).await;
        assert_eq!(session.last_reading().unwrap().battery_level, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_confirmation_notification_is_discarded_on_subscribe() {
        let session = session_with(
            fast_config().discard_first_notification(true),
            Arc::new(MemorySnapshotStore::new()),
        );
        let mut events = session.events.subscribe();
        let mock = MockTransport::builder().frame(frame(5)).build();
        mock.set_confirmation(Some(frame(10)));

        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);
        assert!(mock.push_notification(&frame(20)));

        let mut readings = session.subscribe_readings();
        tokio::time::timeout(
            Duration::from_secs(5),
            readings.wait_for(|r| r.as_ref().is_some_and(|t| t.battery_level == 20)),
        )
        .await
        .unwrap()
        .unwrap();

        while let Ok(event) = events.try_recv() {
            if let DeviceEvent::Reading { telemetry, .. } = event {
                assert_ne!(telemetry.battery_level, 10);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failure_enters_asleep_and_backfills() {
        let store = Arc::new(MemorySnapshotStore::new());
        let session = session_with(fast_config(), store.clone());
        let mock = MockTransport::builder().frame(frame(64)).build();
        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);

        mock.drop_link();
        mock.set_connect_always_fails(true);
        let connects = mock.connect_calls();

        let reading = session.poll_once().await;
        assert_eq!(reading.unwrap().battery_level, 64);
        assert!(session.is_asleep());
        assert_eq!(mock.connect_calls(), connects + 2);

        // Asleep polls do no radio work
        session.poll_once().await;
        assert_eq!(mock.connect_calls(), connects + 2);
    }

    #[tokio::test]
    async fn test_poll_reconnects_and_resubscribes() {
        let session = session();
        let mock = MockTransport::builder().frame(frame(64)).build();
        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);

        mock.drop_link();
        mock.set_frame(Some(frame(63)));

        assert_eq!(session.poll_once().await.unwrap().battery_level, 63);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(mock.is_subscribed_now());
        assert_eq!(mock.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_valid_reading_wakes_asleep_session() {
        let session = session();
        let mut events = session.events.subscribe();
        session.enter_asleep();
        assert!(session.is_asleep());

        session.on_notification(&frame(90)).await;
        assert_eq!(session.state(), SessionState::Connected);

        assert!(matches!(events.recv().await.unwrap(), DeviceEvent::Asleep { .. }));
        assert!(matches!(events.recv().await.unwrap(), DeviceEvent::Awake { .. }));
        assert!(matches!(events.recv().await.unwrap(), DeviceEvent::Reading { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_still_updates_memory() {
        let session = session_with(fast_config(), Arc::new(FailingStore));
        session.on_notification(&frame(33)).await;
        assert_eq!(session.last_reading().unwrap().battery_level, 33);
        assert!(session.restore().await.is_some());
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store = Arc::new(MemorySnapshotStore::new());
        let identity = DeviceIdentity::new("AA:BB:CC:DD:EE:FF");
        let telemetry = FrameDecoder::default().try_decode(&frame(12)).unwrap();
        store.save(&identity, &telemetry).await.unwrap();

        let session = session_with(fast_config(), store);
        assert_eq!(session.restore().await.unwrap().battery_level, 12);
        assert_eq!(session.last_reading().unwrap().battery_level, 12);
    }

    #[tokio::test]
    async fn test_send_command() {
        let session = session();
        assert!(!session.send_command(Command::TurnOn).await);

        let mock = MockTransport::builder().frame(frame(1)).build();
        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);
        assert!(session.send_command(Command::TurnOff).await);
        assert_eq!(mock.written(), vec![Command::TurnOff.encode().to_vec()]);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_unreachable_device_enters_asleep() {
        let session = session();
        let mock = MockTransport::builder().frame(frame(61)).build();
        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);

        mock.drop_link();
        mock.set_connect_always_fails(true);
        assert!(!session.send_command(Command::TurnOn).await);
        assert!(session.is_asleep());
        assert_eq!(session.last_reading().unwrap().battery_level, 61);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_connected() {
        let session = session();
        let mock = MockTransport::builder().frame(frame(1)).build();
        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);

        mock.set_write_fails(true);
        assert!(!session.send_command(Command::TurnOn).await);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_poll_skips_when_link_busy() {
        let session = session();
        session.on_notification(&frame(50)).await;
        let mock = MockTransport::builder().connected(true).frame(frame(10)).build();
        *session.link.lock().await = Some(Link::new(
            session.identity().clone(),
            Box::new(mock.clone()),
            LinkConfig::default(),
        ));

        let _guard = session.link.lock().await;
        assert_eq!(session.poll_once().await.unwrap().battery_level, 50);
        assert_eq!(mock.read_calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let session = session();
        let mock = MockTransport::builder().frame(frame(1)).build();
        assert!(session.bind_transport_handle(Box::new(mock.clone())).await);

        session.shutdown().await;
        session.shutdown().await;

        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(mock.unsubscribe_calls(), 1);
        assert_eq!(mock.disconnect_calls(), 1);
        assert_eq!(mock.handle_count(), 1);
        assert!(!session.bind_transport_handle(Box::new(mock)).await);
        assert!(!session.send_command(Command::TurnOn).await);
    }

    #[tokio::test]
    async fn test_wait_until_connected() {
        let session = session();
        assert!(!session.wait_until_connected(Duration::from_millis(10)).await);

        let binder = Arc::clone(&session);
        tokio::spawn(async move {
            binder
                .bind_transport_handle(Box::new(MockTransport::builder().frame(frame(1)).build()))
                .await
        });
        assert!(session.wait_until_connected(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_wait_until_connected_returns_on_terminate() {
        let session = session();
        session.shutdown().await;
        assert!(!session.wait_until_connected(Duration::from_secs(3600)).await);
    }
}
