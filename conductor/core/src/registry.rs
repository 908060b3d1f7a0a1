//! Session Registry
//!
//! Process-wide table of live sessions. This map is the only shared mutable
//! state in the conductor; everything else reaches a session through it.
//!
//! Operations on one id serialize on the map's shard lock (and on the
//! session's own operation gate), while independent ids proceed in parallel.
//! Removal always closes the session first, which cancels its channel, so no
//! channel outlives the session that owned it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConductorConfig;
use crate::error::StreamError;
use crate::messages::SessionId;
use crate::session::{Session, SessionState};

/// Registry settings
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Bound on waiting for a cancelled channel to wind down
    pub cancel_grace: Duration,
    /// Maximum live sessions (0 = unbounded)
    pub max_sessions: usize,
}

impl RegistryConfig {
    /// Derive registry settings from the loaded configuration
    #[must_use]
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            cancel_grace: config.sessions.cancel_grace,
            max_sessions: config.sessions.max_sessions,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_millis(2000),
            max_sessions: 0,
        }
    }
}

/// Table of sessions keyed by id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    /// Look up `id`, creating an idle session on a miss
    ///
    /// A closed session still present under `id` is replaced with a fresh
    /// one; a reused id never resurrects old state. The lookup counts as
    /// activity, so a session about to receive a request is not swept.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidRequest`] when creating a session would
    /// exceed `max_sessions`.
    pub fn get_or_create(&self, id: &SessionId) -> Result<Arc<Session>, StreamError> {
        let max = self.config.max_sessions;
        // Checked outside the entry lock: len() visits every shard
        if max > 0 && !self.sessions.contains_key(id) && self.sessions.len() >= max {
            tracing::warn!(max_sessions = max, "Session limit reached, rejecting new session");
            return Err(StreamError::InvalidRequest(format!(
                "session limit of {max} reached"
            )));
        }

        let session = match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state() == SessionState::Closed {
                    let fresh = Arc::new(Session::new(id.clone(), self.config.cancel_grace));
                    entry.insert(Arc::clone(&fresh));
                    tracing::debug!(session_id = %id, "Replaced closed session");
                    fresh
                } else {
                    entry.get().touch();
                    Arc::clone(entry.get())
                }
            }
            Entry::Vacant(entry) => {
                let fresh = Arc::new(Session::new(id.clone(), self.config.cancel_grace));
                entry.insert(Arc::clone(&fresh));
                tracing::info!(session_id = %id, "Session created");
                fresh
            }
        };

        Ok(session)
    }

    /// Look up `id` without creating it
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `id` is present
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all sessions
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close and remove `id`
    ///
    /// The session's channel is cancelled before the entry goes away. If the
    /// id was recreated while closing, the fresh session is left alone.
    /// Returns false if `id` was not present.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        session.close().await;
        self.forget(&session);
        tracing::info!(session_id = %id, "Session removed");
        true
    }

    /// Drop the entry for `session` unless the id already maps to another
    fn forget(&self, session: &Arc<Session>) {
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));
    }

    /// Close and remove every session idle longer than `max_age`
    ///
    /// Returns the ids that were evicted.
    pub async fn sweep_idle(&self, max_age: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for(now) > max_age)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for session in stale {
            // Activity may have arrived since the scan
            if session.idle_for(Instant::now()) <= max_age {
                continue;
            }
            session.evict().await;
            self.forget(&session);
            evicted.push(session.id().clone());
        }

        if !evicted.is_empty() {
            tracing::info!(
                evicted = evicted.len(),
                remaining = self.len(),
                "Evicted idle sessions"
            );
        }
        evicted
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until `shutdown`
    /// fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep_idle(max_age).await;
                    }
                }
            }
            tracing::debug!("Idle sweeper stopped");
        })
    }

    /// Close and remove every session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let count = sessions.len();

        for session in sessions {
            session.close().await;
            self.forget(&session);
        }

        tracing::info!(closed = count, "All sessions closed");
    }
}
