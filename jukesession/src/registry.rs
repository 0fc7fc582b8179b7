//! Process-wide session registry.
//!
//! One registry value owns every live session handle, keyed by venue id.
//! There is deliberately no global singleton: callers construct a registry,
//! share it by cloning, and all session lookups go through it. The inner map
//! lock is short-held and never crossed by an await; session state itself
//! needs no locking because each worker serializes its own mutations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use jukesource::{AudioSink, Notifier, SessionId, TrackRef, TrackResolver};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{SessionEvent, SessionEventEnvelope};
use crate::session::{self, SessionCommand, SessionHandle, SessionState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub(crate) struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    resolver: Arc<dyn TrackResolver>,
    notifier: Arc<dyn Notifier>,
    config: SessionConfig,
    event_tx: broadcast::Sender<SessionEventEnvelope>,
}

impl RegistryInner {
    /// Unconditional removal (public `remove`).
    pub(crate) fn detach(&self, id: &SessionId) {
        if self.sessions.write().unwrap().remove(id).is_some() {
            debug!(session = %id, "Session detached from registry");
        }
    }

    /// Removal on worker termination. Only removes the entry when it still
    /// belongs to the terminating worker; a replacement session registered
    /// under the same id survives.
    pub(crate) fn detach_worker(&self, id: &SessionId, tx: &mpsc::Sender<SessionCommand>) {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.get(id).is_some_and(|h| h.same_channel(tx)) {
            sessions.remove(id);
            debug!(session = %id, "Session detached from registry");
        }
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // Nobody listening is fine; the channel only errors on zero receivers.
        let _ = self.event_tx.send(SessionEventEnvelope {
            event,
            timestamp: SystemTime::now(),
        });
    }
}

/// Creates sessions on first use and routes command-layer calls to them.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        resolver: Arc<dyn TrackResolver>,
        notifier: Arc<dyn Notifier>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                resolver,
                notifier,
                config,
                event_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            }),
        }
    }

    /// Return the live session for `id`, creating one bound to `sink` when
    /// absent. At most one live session exists per id; an existing session
    /// keeps its own sink and the argument is ignored.
    pub fn get_or_create(
        &self,
        id: impl Into<SessionId>,
        sink: Arc<dyn AudioSink>,
    ) -> SessionHandle {
        let id = id.into();
        let mut sessions = self.inner.sessions.write().unwrap();

        if let Some(handle) = sessions.get(&id) {
            if !handle.is_closed() {
                return handle.clone();
            }
            // The worker ended without detaching yet; replace it.
        }

        debug!(session = %id, "Creating session");
        let handle = session::spawn(
            id.clone(),
            sink,
            Arc::clone(&self.inner.resolver),
            Arc::clone(&self.inner.notifier),
            self.inner.config.clone(),
            Arc::downgrade(&self.inner),
        );
        sessions.insert(id, handle.clone());
        handle
    }

    /// The live session for `id`, if any.
    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        let sessions = self.inner.sessions.read().unwrap();
        sessions.get(id).filter(|h| !h.is_closed()).cloned()
    }

    /// Like [`SessionRegistry::get`] but reports the miss as an error.
    pub fn handle(&self, id: &SessionId) -> Result<SessionHandle> {
        self.get(id).ok_or_else(|| Error::SessionNotFound(id.clone()))
    }

    /// Detach `id` without stopping it. Idempotent; a subsequent
    /// `get_or_create` builds a fresh session.
    pub fn remove(&self, id: &SessionId) {
        self.inner.detach(id);
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to structured session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEventEnvelope> {
        self.inner.event_tx.subscribe()
    }

    // ----- command-layer surface ------------------------------------------
    //
    // Thin forwards matching the contract consumed by the bot-framework
    // layer: resolve-or-create where the call always succeeds, report a
    // usage error where a matching state is required.

    /// Queue `track` for `id`, creating the session (bound to `sink`) on
    /// first use. Always succeeds for a live venue: a session that ends
    /// between lookup and delivery is replaced and the enqueue retried.
    pub async fn enqueue(
        &self,
        id: impl Into<SessionId>,
        sink: Arc<dyn AudioSink>,
        track: impl Into<TrackRef>,
    ) -> Result<()> {
        let id = id.into();
        let track = track.into();
        match self
            .get_or_create(id.clone(), Arc::clone(&sink))
            .enqueue(track.clone())
            .await
        {
            Err(Error::SessionClosed(_)) => {
                debug!(session = %id, "Session ended mid-enqueue, recreating");
                self.get_or_create(id, sink).enqueue(track).await
            }
            other => other,
        }
    }

    pub async fn skip(&self, id: &SessionId) -> Result<()> {
        match self.get(id) {
            Some(handle) => handle.skip().await,
            None => Err(Error::NothingPlaying),
        }
    }

    pub async fn pause(&self, id: &SessionId) -> Result<()> {
        match self.get(id) {
            Some(handle) => handle.pause().await,
            None => Err(Error::NothingToPause),
        }
    }

    pub async fn resume(&self, id: &SessionId) -> Result<()> {
        match self.get(id) {
            Some(handle) => handle.resume().await,
            None => Err(Error::NothingToResume),
        }
    }

    /// Stop and remove the session. Idempotent: stopping an absent or
    /// already-stopped session is not an error.
    pub async fn stop(&self, id: &SessionId) -> Result<()> {
        match self.get(id) {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    /// Pending tracks in play order; empty when the session is absent.
    pub async fn list_queue(&self, id: &SessionId) -> Vec<TrackRef> {
        match self.get(id) {
            Some(handle) => handle.queue_snapshot().await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Empty the pending queue; a no-op when the session is absent.
    pub async fn clear_queue(&self, id: &SessionId) -> Result<()> {
        match self.get(id) {
            Some(handle) => handle.clear_queue().await,
            None => Ok(()),
        }
    }

    /// Current state, `None` when no live session exists for `id`.
    pub async fn state(&self, id: &SessionId) -> Option<SessionState> {
        match self.get(id) {
            Some(handle) => handle.state().await.ok(),
            None => None,
        }
    }
}
