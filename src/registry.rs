//! Session registry
//!
//! Process-wide mapping from username to live `Session`. Every membership
//! change and every read goes through one `RwLock`, so registration is a
//! single check-and-insert and fanout iterates over a consistent snapshot.
//!
//! Join and leave announcements are serialized by a separate presence lock,
//! so every peer sees each `IN:` exactly once and never after its `OUT:`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use rsa::RsaPublicKey;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tracing::debug;

use crate::error::{RegistryError, SendError};
use crate::protocol::ServerFrame;
use crate::types::Username;

/// A connected, registered client
///
/// Holds the outbound channel to the client's writer task and the client's
/// public key, which is absent until the key exchange completes.
#[derive(Debug)]
pub struct Session {
    username: Username,
    sender: mpsc::Sender<ServerFrame>,
    public_key: OnceLock<RsaPublicKey>,
    announced: AtomicBool,
}

impl Session {
    pub fn new(username: Username, sender: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            username,
            sender,
            public_key: OnceLock::new(),
            announced: AtomicBool::new(false),
        }
    }

    pub fn username(&self) -> &str {
        self.username.as_str()
    }

    /// Queue a frame for this client
    ///
    /// Returns an error if the channel is closed (client disconnected).
    pub async fn send(&self, frame: ServerFrame) -> Result<(), SendError> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Record the client's public key. Only the first key is kept.
    pub fn set_public_key(&self, key: RsaPublicKey) -> bool {
        self.public_key.set(key).is_ok()
    }

    pub fn public_key(&self) -> Option<&RsaPublicKey> {
        self.public_key.get()
    }

    /// Whether peers have been told this session joined
    ///
    /// Only changes while the registry's presence lock is held.
    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    pub fn mark_announced(&self) {
        self.announced.store(true, Ordering::Release);
    }

    /// Completes once the client's writer task has gone away
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

/// Shared username → session directory
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    presence: Arc<Mutex<()>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username` unless it is already taken
    ///
    /// The presence check and the insert happen under one write lock.
    pub async fn try_register(
        &self,
        username: Username,
        sender: mpsc::Sender<ServerFrame>,
    ) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(username.as_str()) {
            return Err(RegistryError::UsernameTaken(username.to_string()));
        }
        let session = Arc::new(Session::new(username.clone(), sender));
        sessions.insert(username.to_string(), Arc::clone(&session));
        debug!("Total sessions: {}", sessions.len());
        Ok(session)
    }

    /// Remove `session` if it is still the registered entry for its name
    pub async fn remove(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions
            .get(session.username())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if removed {
            sessions.remove(session.username());
        }
        debug!("Total sessions: {}", sessions.len());
        removed
    }

    pub async fn get(&self, username: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(username).cloned()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.sessions.read().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Every session except `exclude`, cloned out of the lock
    pub async fn snapshot_except(&self, exclude: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(name, _)| name.as_str() != exclude)
            .map(|(_, session)| Arc::clone(session))
            .collect()
    }

    /// Every announced session except `exclude`
    ///
    /// Sessions still in the key exchange are invisible to presence.
    pub async fn announced_except(&self, exclude: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(name, session)| name.as_str() != exclude && session.is_announced())
            .map(|(_, session)| Arc::clone(session))
            .collect()
    }

    /// Serialize a join or leave announcement against all others
    ///
    /// Hold the guard from the `announced` check or change until every
    /// presence frame for that event has been queued.
    pub async fn lock_presence(&self) -> MutexGuard<'_, ()> {
        self.presence.lock().await
    }
}
