//! Per-instance registry of live connections.
//!
//! The registry maps each locally connected user to the handle of its session.
//! Handles are the only way to write to a connection: every payload goes through
//! the session's outbound queue, which a single writer task drains onto the socket.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_protocol::UserId;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Identifier of a session, unique within one instance.
pub type SessionId = u64;

/// Errors when handing a payload to a session's writer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is full.
    #[error("Outbound queue full")]
    QueueFull,

    /// The writer has gone away.
    #[error("Connection closed")]
    Closed,
}

/// Handle to a live local session.
///
/// Cloning a handle is cheap; all clones feed the same outbound queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    user: UserId,
    outbound: mpsc::Sender<Bytes>,
    shutdown: Arc<Notify>,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(id: SessionId, user: UserId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            user,
            outbound: tx,
            shutdown: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    /// Get the session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Get the user this session belongs to.
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Queue a payload without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or the writer is gone.
    pub fn try_deliver(&self, payload: Bytes) -> Result<(), DeliveryError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Queue a payload, waiting for room in the queue.
    ///
    /// On failure the payload is handed back so the caller can keep it.
    ///
    /// # Errors
    ///
    /// Returns the payload if the writer is gone.
    pub async fn deliver(&self, payload: Bytes) -> Result<(), Bytes> {
        self.outbound.send(payload).await.map_err(|e| e.0)
    }

    /// Ask the connection owning this session to shut down.
    pub fn close(&self) {
        debug!(user = %self.user, session = self.id, "Closing session");
        self.shutdown.notify_one();
    }

    /// Signal fired by [`close`](Self::close).
    ///
    /// Connection loops wait on `signal.notified()`; a close requested before
    /// anyone waits is not lost.
    #[must_use]
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Check whether the writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Map of locally connected users to their sessions.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<UserId, SessionHandle>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh session id.
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a session, replacing any existing one for the same user.
    ///
    /// Returns the displaced handle, if any. The caller is responsible for closing it.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let user = handle.user().clone();
        let id = handle.id();
        let displaced = self.sessions.insert(user.clone(), handle);
        debug!(
            user = %user,
            session = id,
            displaced = ?displaced.as_ref().map(SessionHandle::id),
            "Registered session"
        );
        displaced
    }

    /// Remove whatever session is registered for a user.
    ///
    /// Idempotent: returns `false` if nothing was registered.
    pub fn unregister(&self, user: &UserId) -> bool {
        let removed = self.sessions.remove(user).is_some();
        if removed {
            debug!(user = %user, "Unregistered session");
        }
        removed
    }

    /// Remove the registration for a user only if it still belongs to `session`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn unregister_session(&self, user: &UserId, session: SessionId) -> bool {
        let removed = self
            .sessions
            .remove_if(user, |_, handle| handle.id() == session)
            .is_some();
        trace!(user = %user, session, removed, "Unregister session");
        removed
    }

    /// Look up the session for a user.
    #[must_use]
    pub fn lookup(&self, user: &UserId) -> Option<SessionHandle> {
        self.sessions.get(user).map(|entry| entry.value().clone())
    }

    /// Check whether a user is connected to this instance.
    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        self.sessions.contains_key(user)
    }

    /// Number of live local sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Get all locally connected users.
    #[must_use]
    pub fn users(&self) -> Vec<UserId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(registry: &ConnectionRegistry, user: &str) -> (SessionHandle, mpsc::Receiver<Bytes>) {
        SessionHandle::new(registry.next_session_id(), UserId::from(user), 8)
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = ConnectionRegistry::new();
        let (bob, _rx) = handle(&registry, "bob");
        let bob_id = bob.id();

        assert!(registry.register(bob).is_none());
        assert!(registry.contains(&"bob".into()));
        assert_eq!(registry.lookup(&"bob".into()).unwrap().id(), bob_id);
        assert!(registry.lookup(&"alice".into()).is_none());

        assert!(registry.unregister(&"bob".into()));
        assert!(!registry.unregister(&"bob".into()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_returns_displaced() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(&registry, "bob");
        let (second, _rx2) = handle(&registry, "bob");
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first);
        let displaced = registry.register(second).unwrap();

        assert_eq!(displaced.id(), first_id);
        assert_eq!(registry.lookup(&"bob".into()).unwrap().id(), second_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_session_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(&registry, "bob");
        let (second, _rx2) = handle(&registry, "bob");
        let first_id = first.id();
        let second_id = second.id();

        registry.register(first);
        registry.register(second);

        assert!(!registry.unregister_session(&"bob".into(), first_id));
        assert!(registry.contains(&"bob".into()));
        assert!(registry.unregister_session(&"bob".into(), second_id));
        assert!(!registry.contains(&"bob".into()));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry.next_session_id();
        let b = registry.next_session_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_try_deliver_full_and_closed() {
        let (handle, mut rx) = SessionHandle::new(1, "bob".into(), 1);

        handle.try_deliver(Bytes::from_static(b"one")).unwrap();
        assert_eq!(
            handle.try_deliver(Bytes::from_static(b"two")),
            Err(DeliveryError::QueueFull)
        );
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));

        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(
            handle.try_deliver(Bytes::from_static(b"three")),
            Err(DeliveryError::Closed)
        );
        assert_eq!(
            handle.deliver(Bytes::from_static(b"four")).await,
            Err(Bytes::from_static(b"four"))
        );
    }

    #[tokio::test]
    async fn test_close_before_wait_is_not_lost() {
        let (handle, _rx) = SessionHandle::new(1, "bob".into(), 1);
        let signal = handle.shutdown_signal();

        handle.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.notified())
            .await
            .unwrap();
    }
}
