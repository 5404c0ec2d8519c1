//! Sessions keyed by device identity.
//!
//! The registry is the one place sessions are created, so two presence
//! signals for a new address can never produce two sessions. It is shared by
//! `Arc` between the recovery supervisor, the poller and the daemon.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use laifen_types::DeviceIdentity;

use crate::events::EventDispatcher;
use crate::session::{Session, SessionConfig};
use crate::snapshot::SnapshotStore;

/// Owner of every [`Session`] in the process.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<DeviceIdentity, Arc<Session>>>,
    store: Arc<dyn SnapshotStore>,
    config: SessionConfig,
    events: EventDispatcher,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry whose sessions persist through `store`.
    pub fn new(store: Arc<dyn SnapshotStore>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            config,
            events: EventDispatcher::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Publish session events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Derive every session's token from `token`.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Event dispatcher shared by all sessions.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Configuration given to new sessions.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Return the session for `identity`, creating it if absent.
    ///
    /// A new session is restored from the snapshot store before it is
    /// returned.
    pub async fn get_or_create(&self, identity: &DeviceIdentity) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(identity) {
            return Arc::clone(session);
        }

        let session = {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get(identity) {
                return Arc::clone(session);
            }
            let session = Session::new(
                identity.clone(),
                self.config.clone(),
                Arc::clone(&self.store),
                self.events.clone(),
                self.cancel.child_token(),
            );
            sessions.insert(identity.clone(), Arc::clone(&session));
            session
        };

        info!(device = %identity, "Session created");
        session.restore().await;
        session
    }

    /// Look up an existing session.
    pub async fn get(&self, identity: &DeviceIdentity) -> Option<Arc<Session>> {
        self.sessions.read().await.get(identity).cloned()
    }

    /// Remove a session and shut it down.
    pub async fn remove(&self, identity: &DeviceIdentity) -> bool {
        let removed = self.sessions.write().await.remove(identity);
        match removed {
            Some(session) => {
                session.shutdown().await;
                info!(device = %identity, "Session removed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of all sessions.
    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Identities of all sessions.
    pub async fn identities(&self) -> Vec<DeviceIdentity> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Number of sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Shut down every session concurrently.
    pub async fn shutdown_all(&self) {
        let sessions = self.all().await;
        info!(count = sessions.len(), "Shutting down sessions");
        join_all(sessions.iter().map(|s| s.shutdown())).await;
    }
}
