//! The long-running toothbrush daemon.
//!
//! Wires the snapshot store, the session registry, presence monitoring, the
//! recovery supervisor and the poller together, then waits for Ctrl-C.

use std::sync::Arc;

use futures::future::join_all;
use laifen_core::scan::get_adapter;
use laifen_core::{
    DeviceEvent, DeviceIdentity, EventDispatcher, Poller, PresenceEvent, PresenceMonitor,
    RecoverySupervisor, Session, SessionRegistry,
};
use laifen_store::Store;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::snapshots::SqliteSnapshots;

/// Capacity of the presence channel between the monitor and the supervisor.
const PRESENCE_BUFFER: usize = 32;

/// Outcome of the startup readiness gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Devices that connected within the setup timeout.
    pub ready: Vec<DeviceIdentity>,
    /// Devices still being retried in the background.
    pub deferred: Vec<DeviceIdentity>,
}

impl Readiness {
    /// Whether every configured device connected in time.
    pub fn all_ready(&self) -> bool {
        self.deferred.is_empty()
    }
}

/// Background tasks started by [`Daemon::start`].
#[derive(Debug)]
pub struct Tasks {
    events: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    poller: JoinHandle<()>,
}

/// Toothbrush daemon.
pub struct Daemon {
    config: Config,
    registry: Arc<SessionRegistry>,
    snapshots: Arc<SqliteSnapshots>,
    /// Cancels the background tasks.
    tasks: CancellationToken,
    /// Parent of every token, cancelled last.
    root: CancellationToken,
}

impl Daemon {
    /// Build a daemon over an opened snapshot store.
    pub fn new(config: Config, store: Store) -> Self {
        let root = CancellationToken::new();
        let snapshots = Arc::new(SqliteSnapshots::new(store));
        let registry = SessionRegistry::new(snapshots.clone(), config.session_config())
            .with_events(EventDispatcher::default())
            .with_cancel_token(root.child_token());

        Self {
            config,
            registry: Arc::new(registry),
            snapshots,
            tasks: root.child_token(),
            root,
        }
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a session for every configured device, restored from the store.
    pub async fn restore_devices(&self) -> Vec<Arc<Session>> {
        let mut sessions = Vec::with_capacity(self.config.devices.len());
        for device in &self.config.devices {
            let session = self.registry.get_or_create(&device.identity()).await;
            match session.last_reading() {
                Some(reading) => info!(
                    device = %session.identity(),
                    alias = ?device.alias,
                    battery = reading.battery_level,
                    "Restored last known state"
                ),
                None => info!(device = %session.identity(), alias = ?device.alias, "No stored state"),
            }
            sessions.push(session);
        }
        sessions
    }

    /// Start the event log, the recovery supervisor and the poller.
    ///
    /// `presence` feeds the supervisor; the caller owns the sending side.
    pub fn start(&self, presence: mpsc::Receiver<PresenceEvent>) -> Tasks {
        let events = tokio::spawn(log_events(
            self.registry.events().subscribe(),
            Arc::clone(&self.snapshots),
            self.config.clone(),
            self.root.clone(),
        ));
        let supervisor =
            RecoverySupervisor::new(Arc::clone(&self.registry)).start(presence, self.tasks.clone());
        let poller = Poller::new(Arc::clone(&self.registry))
            .interval(self.config.session.poll_interval())
            .start(self.tasks.clone());

        Tasks {
            events,
            supervisor,
            poller,
        }
    }

    /// Give configured devices up to `setup_timeout` to connect.
    ///
    /// Devices that miss the deadline are not an error: the supervisor keeps
    /// binding them whenever they are seen.
    pub async fn wait_ready(&self, sessions: &[Arc<Session>]) -> Readiness {
        let timeout = self.config.session.setup_timeout();
        let outcomes = join_all(sessions.iter().map(|s| s.wait_until_connected(timeout))).await;

        let mut readiness = Readiness::default();
        for (session, connected) in sessions.iter().zip(outcomes) {
            let identity = session.identity().clone();
            if connected {
                info!(device = %identity, "Device ready");
                readiness.ready.push(identity);
            } else {
                info!(device = %identity, ?timeout, "Device not ready, setup deferred");
                readiness.deferred.push(identity);
            }
        }
        readiness
    }

    /// Stop background work, then unsubscribe and disconnect every session.
    pub async fn shutdown(&self, tasks: Tasks) {
        info!("Shutting down");
        self.tasks.cancel();
        for (name, handle) in [("supervisor", tasks.supervisor), ("poller", tasks.poller)] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background task failed");
            }
        }

        self.registry.shutdown_all().await;
        self.root.cancel();
        if let Err(e) = tasks.events.await {
            warn!(task = "events", error = %e, "Background task failed");
        }
        info!("Shutdown complete");
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        let adapter = get_adapter().await?;
        let sessions = self.restore_devices().await;

        let (tx, rx) = mpsc::channel(PRESENCE_BUFFER);
        let tasks = self.start(rx);

        let mut monitor = PresenceMonitor::new(adapter).debounce(self.config.scan.seen_debounce());
        if !self.config.devices.is_empty() {
            monitor = monitor.identities(self.config.identities());
        }
        let monitor = {
            let cancel = self.tasks.clone();
            tokio::spawn(async move {
                if let Err(e) = monitor.run(tx, cancel).await {
                    error!(error = %e, "Presence monitor failed");
                }
            })
        };

        tokio::select! {
            readiness = self.wait_ready(&sessions) => {
                info!(
                    ready = readiness.ready.len(),
                    deferred = readiness.deferred.len(),
                    "Daemon ready"
                );
                tokio::signal::ctrl_c().await?;
            }
            signal = tokio::signal::ctrl_c() => signal?,
        }

        self.shutdown(tasks).await;
        if let Err(e) = monitor.await {
            warn!(task = "monitor", error = %e, "Background task failed");
        }
        Ok(())
    }
}

async fn log_events(
    mut rx: broadcast::Receiver<DeviceEvent>,
    snapshots: Arc<SqliteSnapshots>,
    config: Config,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if let DeviceEvent::Discovered { device, name, .. } = &event
            && let Err(e) = snapshots.record_device(device, name.as_deref()).await
        {
            warn!(device = %device, error = %e, "Failed to record device");
        }

        let alias = config.alias_of(event.device()).unwrap_or("-");
        match serde_json::to_string(&event) {
            Ok(json) => debug!(alias, event = %json, "Device event"),
            Err(e) => debug!(alias, error = %e, "Unserializable device event"),
        }
    }
}
