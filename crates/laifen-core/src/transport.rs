//! The BLE transport seam.
//!
//! A [`Transport`] is everything the link needs from one radio-level
//! connection: connect, read, write and notify on a characteristic. The real
//! implementation is [`BleTransport`](crate::ble::BleTransport); tests use
//! [`MockTransport`](crate::mock::MockTransport).

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::Result;

/// One value pushed by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic the value was published on.
    pub characteristic: Uuid,
    /// Raw bytes.
    pub value: Vec<u8>,
}

/// Stream of notifications for every subscribed characteristic of a peripheral.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Notification> + Send>>;

/// Exclusive handle to one potential or active connection.
///
/// Handles are moved into a [`Link`](crate::link::Link) and never shared: a
/// fresh handle for the same device replaces the old one.
pub type TransportHandle = Box<dyn Transport>;

/// Operations on one BLE peripheral.
///
/// Methods mirror GATT operations one-to-one and do not retry; bounded retry
/// and timeouts are layered on top by the link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address or platform identifier of the peripheral.
    fn address(&self) -> &str;

    /// Advertised name, if known.
    fn name(&self) -> Option<&str>;

    /// Query the BLE stack for the connection state.
    async fn is_connected(&self) -> bool;

    /// Open the connection and discover services.
    async fn connect(&self) -> Result<()>;

    /// Close the connection. Closing a closed connection is not an error.
    async fn disconnect(&self) -> Result<()>;

    /// Read a characteristic.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic with response.
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Enable notifications on a characteristic.
    ///
    /// Returns [`Error::AlreadySubscribed`](crate::Error::AlreadySubscribed)
    /// if the stack reports notifications as already enabled.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Stream of incoming notifications.
    async fn notifications(&self) -> Result<NotificationStream>;
}
