//! Mock transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without Bluetooth hardware.
//! Clones share state, so a test can hand one clone to a link as its
//! [`TransportHandle`](crate::transport::TransportHandle) and keep another to
//! drive the simulated device.
//!
//! # Features
//!
//! - **Failure injection**: transient or permanent connect failures, subscribe
//!   failures, "already subscribed" responses, read/write/disconnect errors
//! - **Latency simulation**: artificial connect and read delays
//! - **Link loss**: drop the connection as a sleeping toothbrush would
//! - **Push path**: inject notifications into active subscriptions
//! - **Call counters**: verify how many transport operations ran

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use laifen_types::uuid::DATA_CHARACTERISTIC;

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::{Notification, NotificationStream, Transport};

#[derive(Default)]
struct MockState {
    connected: AtomicBool,
    subscribed: AtomicBool,

    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    subscribe_calls: AtomicU32,
    unsubscribe_calls: AtomicU32,
    read_calls: AtomicU32,

    connect_failures: AtomicU32,
    connect_always_fails: AtomicBool,
    subscribe_failures: AtomicU32,
    already_subscribed: AtomicBool,
    read_fails: AtomicBool,
    write_fails: AtomicBool,
    disconnect_fails: AtomicBool,

    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    /// Simulated read latency in milliseconds (0 = no delay).
    read_latency_ms: AtomicU64,

    frame: Mutex<Option<Vec<u8>>>,
    /// Delivered as soon as a notification stream opens.
    confirmation: Mutex<Option<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

/// A simulated toothbrush.
///
/// # Example
///
/// ```
/// use laifen_core::{MockTransport, Transport};
///
/// #[tokio::main]
/// async fn main() {
///     let device = MockTransport::builder().address("AA:BB").connect_failures(1).build();
///     assert!(device.connect().await.is_err());
///     assert!(device.connect().await.is_ok());
///     assert_eq!(device.connect_calls(), 2);
/// }
/// ```
#[derive(Clone)]
pub struct MockTransport {
    address: String,
    name: Option<String>,
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("address", &self.address)
            .field("connected", &self.state.connected.load(Ordering::Relaxed))
            .field("subscribed", &self.state.subscribed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockTransport {
    /// Create a disconnected mock with the given address.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            name: Some("LFTB-MOCK".to_string()),
            state: Arc::new(MockState::default()),
        }
    }

    /// Start building a mock.
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::new()
    }

    // --- Simulated device ---

    /// Set the frame returned by characteristic reads (`None` reads empty).
    pub fn set_frame(&self, frame: Option<Vec<u8>>) {
        *lock(&self.state.frame) = frame;
    }

    /// Push a notification to every active subscription.
    ///
    /// Returns `false` if nothing was delivered because the link is down,
    /// notifications are disabled, or nobody is listening.
    pub fn push_notification(&self, value: &[u8]) -> bool {
        if !self.is_connected_now() || !self.is_subscribed_now() {
            return false;
        }
        let notification = Notification {
            characteristic: DATA_CHARACTERISTIC,
            value: value.to_vec(),
        };
        let mut subscribers = lock(&self.state.subscribers);
        subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
        !subscribers.is_empty()
    }

    /// Deliver `value` on every notification stream the moment it opens,
    /// like the subscription confirmation some firmware sends.
    pub fn set_confirmation(&self, value: Option<Vec<u8>>) {
        *lock(&self.state.confirmation) = value;
    }

    /// Drop the connection as if the device fell asleep.
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.subscribed.store(false, Ordering::SeqCst);
    }

    // --- Failure injection ---

    /// Fail the next `count` connect attempts.
    pub fn set_connect_failures(&self, count: u32) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Fail every connect attempt until cleared.
    pub fn set_connect_always_fails(&self, fail: bool) {
        self.state.connect_always_fails.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` subscribe attempts with a timeout.
    pub fn set_subscribe_failures(&self, count: u32) {
        self.state.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// Report "already subscribed" from every subscribe.
    pub fn set_already_subscribed(&self, already: bool) {
        self.state.already_subscribed.store(already, Ordering::SeqCst);
    }

    /// Fail characteristic reads.
    pub fn set_read_fails(&self, fail: bool) {
        self.state.read_fails.store(fail, Ordering::SeqCst);
    }

    /// Fail characteristic writes.
    pub fn set_write_fails(&self, fail: bool) {
        self.state.write_fails.store(fail, Ordering::SeqCst);
    }

    /// Fail disconnects (the connection stays up).
    pub fn set_disconnect_fails(&self, fail: bool) {
        self.state.disconnect_fails.store(fail, Ordering::SeqCst);
    }

    /// Delay every connect attempt.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.state
            .connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every read.
    pub fn set_read_latency(&self, latency: Duration) {
        self.state
            .read_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    // --- Inspection ---

    /// Connection state without going through the trait.
    pub fn is_connected_now(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Whether notifications are enabled.
    pub fn is_subscribed_now(&self) -> bool {
        self.state.subscribed.load(Ordering::SeqCst)
    }

    /// Number of `connect` calls.
    pub fn connect_calls(&self) -> u32 {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_calls(&self) -> u32 {
        self.state.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Number of `subscribe` calls.
    pub fn subscribe_calls(&self) -> u32 {
        self.state.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of `unsubscribe` calls.
    pub fn unsubscribe_calls(&self) -> u32 {
        self.state.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of `read` calls.
    pub fn read_calls(&self) -> u32 {
        self.state.read_calls.load(Ordering::SeqCst)
    }

    /// Every value written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state.written).clone()
    }

    /// Number of live clones of this mock, including the caller's.
    ///
    /// Drops to one once a link has released its handle.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.state)
    }

    async fn simulate_latency(millis: u64) {
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected_now() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

/// Lock a mock mutex, recovering from poisoning in tests that panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn is_connected(&self) -> bool {
        self.is_connected_now()
    }

    async fn connect(&self) -> Result<()> {
        let state = &self.state;
        state.connect_calls.fetch_add(1, Ordering::SeqCst);
        Self::simulate_latency(state.connect_latency_ms.load(Ordering::SeqCst)).await;

        let transient = state
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || state.connect_always_fails.load(Ordering::SeqCst) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::OutOfRange,
            ));
        }

        state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.disconnect_fails.load(Ordering::SeqCst) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::BleError("mock disconnect failure".to_string()),
            ));
        }
        self.drop_link();
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.state.read_calls.fetch_add(1, Ordering::SeqCst);
        self.check_connected()?;
        Self::simulate_latency(self.state.read_latency_ms.load(Ordering::SeqCst)).await;

        if characteristic != DATA_CHARACTERISTIC {
            return Err(Error::characteristic_not_found(characteristic.to_string(), 1));
        }
        if self.state.read_fails.load(Ordering::SeqCst) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::BleError("mock read failure".to_string()),
            ));
        }
        Ok(lock(&self.state.frame).clone().unwrap_or_default())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.check_connected()?;
        if self.state.write_fails.load(Ordering::SeqCst) {
            return Err(Error::write_failed(characteristic.to_string(), "mock write failure"));
        }
        lock(&self.state.written).push(data.to_vec());
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_connected()?;

        let failed = self
            .state
            .subscribe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::timeout(
                format!("subscribe {}", characteristic),
                Duration::from_secs(1),
            ));
        }

        self.state.subscribed.store(true, Ordering::SeqCst);
        if self.state.already_subscribed.load(Ordering::SeqCst) {
            return Err(Error::AlreadySubscribed);
        }
        Ok(())
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> Result<()> {
        self.state.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.check_connected()?;
        self.state.subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(value) = lock(&self.state.confirmation).clone() {
            let _ = tx.send(Notification {
                characteristic: DATA_CHARACTERISTIC,
                value,
            });
        }
        lock(&self.state.subscribers).push(tx);
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        })))
    }
}

/// Builder for creating mock transports with custom settings.
#[derive(Debug, Clone)]
pub struct MockTransportBuilder {
    address: String,
    name: Option<String>,
    connected: bool,
    frame: Option<Vec<u8>>,
    connect_failures: u32,
    connect_always_fails: bool,
    subscribe_failures: u32,
    already_subscribed: bool,
    connect_latency: Duration,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        Self {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: Some("LFTB-MOCK".to_string()),
            connected: false,
            frame: None,
            connect_failures: 0,
            connect_always_fails: false,
            subscribe_failures: 0,
            already_subscribed: false,
            connect_latency: Duration::ZERO,
        }
    }
}

impl MockTransportBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address.
    #[must_use]
    pub fn address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    /// Set the advertised name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Start connected.
    #[must_use]
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Frame returned by reads.
    #[must_use]
    pub fn frame(mut self, frame: Vec<u8>) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Fail the first `count` connect attempts.
    #[must_use]
    pub fn connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Fail every connect attempt.
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.connect_always_fails = true;
        self
    }

    /// Fail the first `count` subscribe attempts.
    #[must_use]
    pub fn subscribe_failures(mut self, count: u32) -> Self {
        self.subscribe_failures = count;
        self
    }

    /// Report "already subscribed" from every subscribe.
    #[must_use]
    pub fn already_subscribed(mut self) -> Self {
        self.already_subscribed = true;
        self
    }

    /// Delay every connect attempt.
    #[must_use]
    pub fn connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Build the mock transport.
    #[must_use]
    pub fn build(self) -> MockTransport {
        let mock = MockTransport {
            address: self.address,
            name: self.name,
            state: Arc::new(MockState::default()),
        };
        mock.state.connected.store(self.connected, Ordering::SeqCst);
        mock.set_frame(self.frame);
        mock.set_connect_failures(self.connect_failures);
        mock.set_connect_always_fails(self.connect_always_fails);
        mock.set_subscribe_failures(self.subscribe_failures);
        mock.set_already_subscribed(self.already_subscribed);
        mock.set_connect_latency(self.connect_latency);
        mock
    }
}
