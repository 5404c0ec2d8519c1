//! One transport handle's connection lifecycle.
//!
//! A [`Link`] owns exactly one [`TransportHandle`] and layers bounded retry,
//! timeouts and notification forwarding on top of the raw GATT operations.
//! Every method reports failure as `false`/`None`: an unreachable toothbrush
//! is the normal case, and the session decides what it means.
//!
//! Methods that touch the radio take `&mut self`. Sessions keep their link
//! behind a mutex, so all operations on one device are serialized.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use laifen_types::DeviceIdentity;
use laifen_types::uuid::DATA_CHARACTERISTIC;

use crate::error::Error;
use crate::retry::{RetryConfig, with_retry_cancellable};
use crate::transport::{NotificationStream, Transport, TransportHandle};

/// Timeouts and retry bounds for a [`Link`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Characteristic carrying status frames and commands.
    pub characteristic: Uuid,
    /// Connection attempt batch.
    pub connect_retry: RetryConfig,
    /// Upper bound for a single connection attempt.
    pub connect_timeout: Duration,
    /// Notification subscription attempt batch.
    pub subscribe_retry: RetryConfig,
    /// Upper bound for a single characteristic read.
    pub read_timeout: Duration,
    /// Upper bound for a single characteristic write.
    pub write_timeout: Duration,
    /// Reads repeated while the characteristic returns no data.
    pub empty_read_retry: RetryConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            characteristic: DATA_CHARACTERISTIC,
            connect_retry: RetryConfig::for_connect(),
            connect_timeout: Duration::from_secs(60),
            subscribe_retry: RetryConfig::for_subscribe(),
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(10),
            empty_read_retry: RetryConfig::for_read(),
        }
    }
}

impl LinkConfig {
    /// Set the connection attempt batch.
    #[must_use]
    pub fn connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Set the per-attempt connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the subscription attempt batch.
    #[must_use]
    pub fn subscribe_retry(mut self, retry: RetryConfig) -> Self {
        self.subscribe_retry = retry;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the empty-read retry bound.
    #[must_use]
    pub fn empty_read_retry(mut self, retry: RetryConfig) -> Self {
        self.empty_read_retry = retry;
        self
    }
}

/// Exclusive owner of one transport handle.
///
/// Dropping a link aborts its notification forwarder. Prefer
/// [`Link::disconnect`], which also closes the connection.
pub struct Link {
    identity: DeviceIdentity,
    transport: TransportHandle,
    config: LinkConfig,
    cancel: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("identity", &self.identity)
            .field("forwarding", &self.is_forwarding())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Take ownership of `transport` for `identity`.
    pub fn new(identity: DeviceIdentity, transport: TransportHandle, config: LinkConfig) -> Self {
        Self {
            identity,
            transport,
            config,
            cancel: CancellationToken::new(),
            forwarder: None,
        }
    }

    /// Interrupt retry loops when `token` is cancelled.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Identity this link is bound to.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Configuration in use.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Ask the transport whether the connection is up.
    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Whether a notification forwarder is running.
    pub fn is_forwarding(&self) -> bool {
        self.forwarder.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Connect using the configured attempt batch.
    pub async fn connect(&mut self) -> bool {
        let retry = self.config.connect_retry.clone();
        self.connect_with(&retry).await
    }

    /// Connect, trying at most `retry.attempts()` times.
    ///
    /// Returns `true` without touching the transport if already connected.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.identity, attempts = retry.attempts()))]
    pub async fn connect_with(&mut self, retry: &RetryConfig) -> bool {
        if self.transport.is_connected().await {
            return true;
        }

        let transport = &self.transport;
        let connect_timeout = self.config.connect_timeout;
        let result = with_retry_cancellable(retry, "connect", &self.cancel, || async move {
            match timeout(connect_timeout, transport.connect()).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout("connect", connect_timeout)),
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(device = %self.identity, "Connected");
                true
            }
            Err(Error::Cancelled) => {
                debug!(device = %self.identity, "Connect cancelled");
                false
            }
            Err(e) => {
                warn!(device = %self.identity, error = %e, "Connect attempts exhausted");
                false
            }
        }
    }

    /// Enable notifications and forward matching values into `sink`.
    ///
    /// Succeeds when notifications are already enabled or already being
    /// forwarded. Values are dropped rather than awaited when `sink` is full.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.identity))]
    pub async fn subscribe_notifications(&mut self, sink: mpsc::Sender<Vec<u8>>) -> bool {
        let transport = &self.transport;
        let characteristic = self.config.characteristic;
        let result = with_retry_cancellable(
            &self.config.subscribe_retry,
            "subscribe",
            &self.cancel,
            || async move {
                match transport.subscribe(characteristic).await {
                    Ok(()) | Err(Error::AlreadySubscribed) => Ok(()),
                    Err(e) => Err(e),
                }
            },
        )
        .await;

        if let Err(e) = result {
            warn!(device = %self.identity, error = %e, "Subscribe attempts exhausted");
            return false;
        }

        if self.is_forwarding() {
            return true;
        }

        match self.transport.notifications().await {
            Ok(stream) => {
                self.forwarder = Some(spawn_forwarder(
                    self.identity.clone(),
                    characteristic,
                    stream,
                    sink,
                ));
                debug!(device = %self.identity, "Notifications enabled");
                true
            }
            Err(e) => {
                warn!(device = %self.identity, error = %e, "Failed to open notification stream");
                false
            }
        }
    }

    /// Stop forwarding and disable notifications if still connected.
    pub async fn unsubscribe_notifications(&mut self) {
        self.stop_forwarder();
        if !self.transport.is_connected().await {
            return;
        }
        if let Err(e) = self.transport.unsubscribe(self.config.characteristic).await {
            debug!(device = %self.identity, error = %e, "Unsubscribe failed");
        }
    }

    /// Write `bytes`, reconnecting once if the link is down.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.identity, len = bytes.len()))]
    pub async fn send(&mut self, bytes: &[u8]) -> bool {
        if !self.transport.is_connected().await && !self.connect().await {
            return false;
        }

        let write_timeout = self.config.write_timeout;
        let write = self.transport.write(self.config.characteristic, bytes);
        match timeout(write_timeout, write).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(device = %self.identity, error = %e, "Write failed");
                false
            }
            Err(_) => {
                warn!(device = %self.identity, timeout = ?write_timeout, "Write timed out");
                false
            }
        }
    }

    /// Read the status characteristic.
    ///
    /// Returns `None` when not connected, on error or timeout, and when the
    /// characteristic stays empty through the empty-read retries.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.identity))]
    pub async fn read_current_frame(&mut self) -> Option<Vec<u8>> {
        if !self.transport.is_connected().await {
            return None;
        }

        let retry = &self.config.empty_read_retry;
        for attempt in 0..retry.attempts() {
            let read = self.transport.read(self.config.characteristic);
            match timeout(self.config.read_timeout, read).await {
                Ok(Ok(data)) if !data.is_empty() => return Some(data),
                Ok(Ok(_)) => debug!(device = %self.identity, attempt = attempt + 1, "Empty read"),
                Ok(Err(e)) => {
                    warn!(device = %self.identity, error = %e, "Read failed");
                    return None;
                }
                Err(_) => {
                    warn!(device = %self.identity, timeout = ?self.config.read_timeout, "Read timed out");
                    return None;
                }
            }

            if attempt < retry.max_retries {
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(retry.delay_for_attempt(attempt)) => {}
                }
            }
        }
        None
    }

    /// Close the connection and release the handle.
    ///
    /// Failures are logged; the handle is dropped either way.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.identity))]
    pub async fn disconnect(mut self) {
        self.stop_forwarder();
        match self.transport.disconnect().await {
            Ok(()) => debug!(device = %self.identity, "Disconnected"),
            Err(e) => warn!(device = %self.identity, error = %e, "Disconnect failed, dropping handle"),
        }
    }

    fn stop_forwarder(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}

fn spawn_forwarder(
    identity: DeviceIdentity,
    characteristic: Uuid,
    mut stream: NotificationStream,
    sink: mpsc::Sender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = stream.next().await {
            if notification.characteristic != characteristic {
                continue;
            }
            match sink.try_send(notification.value) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(device = %identity, "Notification buffer full, dropping frame");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        debug!(device = %identity, "Notification forwarder stopped");
    })
}
