//! Periodic refresh of every session.
//!
//! Each tick spawns one `poll_once` per session. A session whose previous
//! poll is still running (a reconnect batch can take seconds) is skipped, so
//! a slow device never delays the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use laifen_types::DeviceIdentity;

use crate::registry::SessionRegistry;

/// Drives [`Session::poll_once`](crate::Session::poll_once) on a fixed interval.
#[derive(Debug, Clone)]
pub struct Poller {
    registry: Arc<SessionRegistry>,
    interval: Duration,
}

impl Poller {
    /// Default tick interval.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    /// Create a poller over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            interval: Self::DEFAULT_INTERVAL,
        }
    }

    /// Set the tick interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Poll until `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut in_flight: HashMap<DeviceIdentity, JoinHandle<()>> = HashMap::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Poller cancelled, shutting down");
                        break;
                    }
                    _ = ticker.tick() => self.tick(&mut in_flight).await,
                }
            }

            for (_, handle) in in_flight.drain() {
                handle.abort();
            }
        })
    }

    async fn tick(&self, in_flight: &mut HashMap<DeviceIdentity, JoinHandle<()>>) {
        in_flight.retain(|_, handle| !handle.is_finished());

        for session in self.registry.all().await {
            let identity = session.identity().clone();
            if in_flight.contains_key(&identity) {
                debug!(device = %identity, "Previous poll still running, skipping");
                continue;
            }
            let handle = tokio::spawn(async move {
                session.poll_once().await;
            });
            in_flight.insert(identity, handle);
        }
    }
}
