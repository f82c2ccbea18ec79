//! Inbound handling for one client connection.
//!
//! A session moves through `Connected → Reading → (Routing → Reading)* → Closed`.
//!
//! - **Connected**: the session is registered locally (closing any session it
//!   displaces), presence goes online and the offline mailbox is flushed to the
//!   connection on a separate task.
//! - **Reading/Routing**: every frame from the client is parsed and routed.
//! - **Closed**: the registration is dropped and presence goes offline. This runs
//!   from [`Session::close`] or, if the session is dropped without closing, from
//!   its `Drop` impl, so cleanup happens whatever way the connection ends.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_protocol::{Envelope, EnvelopeError, UserId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::instance::Instance;
use crate::mailbox::Mailbox;
use crate::registry::SessionHandle;
use crate::router::Route;

/// Session errors. Both end the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client sent something that is not an envelope.
    #[error(transparent)]
    Malformed(#[from] EnvelopeError),

    /// The session was already closed.
    #[error("Session is closed")]
    Closed,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, presence being published.
    Connected,
    /// Waiting for the next client frame.
    Reading,
    /// Routing a frame.
    Routing,
    /// Torn down.
    Closed,
}

/// One client connection's inbound side.
pub struct Session {
    handle: SessionHandle,
    instance: Arc<Instance>,
    state: SessionState,
}

impl Session {
    /// Bring a session up for `user` and return it with its outbound queue.
    ///
    /// The receiver must be drained by the connection's single writer.
    pub(crate) async fn open(
        instance: Arc<Instance>,
        user: UserId,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (handle, outbound) = SessionHandle::new(
            instance.registry().next_session_id(),
            user,
            instance.config().outbound_queue_capacity,
        );

        if let Some(displaced) = instance.registry().register(handle.clone()) {
            info!(
                user = %handle.user(),
                session = handle.id(),
                displaced = displaced.id(),
                "Replacing existing session"
            );
            displaced.close();
        }

        let mut session = Self {
            handle,
            instance,
            state: SessionState::Connected,
        };

        if let Err(e) = session
            .instance
            .presence()
            .set_online(session.handle.user())
            .await
        {
            warn!(user = %session.handle.user(), error = %e, "Failed to mark user online");
        }

        spawn_flush(
            Arc::clone(session.instance.mailbox()),
            session.handle.clone(),
            Arc::clone(session.instance.drained_counter()),
        );

        session.state = SessionState::Reading;
        info!(user = %session.handle.user(), session = session.handle.id(), "Session connected");
        (session, outbound)
    }

    /// Get the session's handle.
    #[must_use]
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Get the connected user.
    #[must_use]
    pub fn user(&self) -> &UserId {
        self.handle.user()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Parse and route one client frame.
    ///
    /// Backend failures are logged and reported as [`Route::Dropped`]; they do not
    /// end the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed or the session is closed. The
    /// caller should stop reading and [`close`](Self::close) the session.
    pub async fn handle_frame(&mut self, raw: Bytes) -> Result<Route, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        let envelope = Envelope::parse(raw)?;

        self.state = SessionState::Routing;
        let recipient = envelope.recipient.clone();
        let route = match self.instance.router().route(envelope).await {
            Ok(route) => route,
            Err(e) => {
                warn!(user = %self.handle.user(), recipient = %recipient, error = %e, "Message dropped");
                Route::Dropped
            }
        };
        self.state = SessionState::Reading;

        debug!(
            user = %self.handle.user(),
            recipient = %recipient,
            route = route.as_str(),
            "Routed message"
        );
        Ok(route)
    }

    /// Tear the session down.
    pub async fn close(mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        let user = self.handle.user().clone();
        if !self
            .instance
            .registry()
            .unregister_session(&user, self.handle.id())
        {
            debug!(user = %user, session = self.handle.id(), "Session was displaced, leaving presence alone");
            return;
        }

        release_presence(&self.instance, &user).await;
        info!(user = %user, session = self.handle.id(), "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        let user = self.handle.user().clone();
        if !self
            .instance
            .registry()
            .unregister_session(&user, self.handle.id())
        {
            return;
        }

        let instance = Arc::clone(&self.instance);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { release_presence(&instance, &user).await });
            }
            Err(_) => warn!(user = %user, "No runtime left to mark user offline"),
        }
    }
}

/// Mark a user offline after their session left the registry.
///
/// A newer session may register and publish "online" while the offline write is
/// in flight. If one is registered once the write completes, presence is set back
/// online so the live connection is not left looking offline.
async fn release_presence(instance: &Instance, user: &UserId) {
    if let Err(e) = instance.presence().set_offline(user).await {
        warn!(user = %user, error = %e, "Failed to mark user offline");
        return;
    }

    if instance.registry().contains(user) {
        debug!(user = %user, "User reconnected during teardown, restoring presence");
        if let Err(e) = instance.presence().set_online(user).await {
            warn!(user = %user, error = %e, "Failed to restore presence");
        }
    }
}

fn spawn_flush(mailbox: Arc<dyn Mailbox>, handle: SessionHandle, drained: Arc<AtomicU64>) {
    tokio::spawn(async move {
        let delivered = flush_mailbox(mailbox.as_ref(), &handle).await;
        drained.fetch_add(delivered as u64, Ordering::Relaxed);
    });
}

/// Drain a user's mailbox into their connection.
///
/// Payloads go through the session's outbound queue, so they never interleave
/// with relay writes mid-frame. Whatever cannot be handed over because the
/// connection closed is appended back to the mailbox.
///
/// Returns the number of payloads handed to the connection.
pub async fn flush_mailbox(mailbox: &dyn Mailbox, handle: &SessionHandle) -> usize {
    let user = handle.user();
    let mut pending: VecDeque<Bytes> = match mailbox.drain_all(user).await {
        Ok(pending) => pending.into(),
        Err(e) => {
            warn!(user = %user, error = %e, "Failed to drain mailbox");
            return 0;
        }
    };

    let mut delivered = 0;
    while let Some(payload) = pending.pop_front() {
        if let Err(payload) = handle.deliver(payload).await {
            pending.push_front(payload);
            warn!(user = %user, undelivered = pending.len(), "Connection closed during flush, re-buffering");
            for payload in pending {
                if let Err(e) = mailbox.append(user, payload).await {
                    warn!(user = %user, error = %e, "Failed to re-buffer message");
                }
            }
            return delivered;
        }
        delivered += 1;
    }

    if delivered > 0 {
        debug!(user = %user, delivered, "Flushed offline mailbox");
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::instance::{Backends, InstanceConfig};
    use crate::mailbox::MemoryMailbox;
    use crate::presence::{MemoryPresence, PresenceStore};
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_flush_delivers_in_order() {
        let mailbox = MemoryMailbox::new();
        let bob = UserId::from("bob");
        for msg in ["one", "two", "three"] {
            mailbox.append(&bob, Bytes::from(msg)).await.unwrap();
        }
        let (handle, mut rx) = SessionHandle::new(1, bob.clone(), 8);

        assert_eq!(flush_mailbox(&mailbox, &handle).await, 3);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("two"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("three"));
        assert_eq!(mailbox.len(&bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush_to_closed_connection_rebuffers() {
        let mailbox = MemoryMailbox::new();
        let bob = UserId::from("bob");
        mailbox.append(&bob, Bytes::from("one")).await.unwrap();
        mailbox.append(&bob, Bytes::from("two")).await.unwrap();
        let (handle, rx) = SessionHandle::new(1, bob.clone(), 8);
        drop(rx);

        assert_eq!(flush_mailbox(&mailbox, &handle).await, 0);
        assert_eq!(
            mailbox.drain_all(&bob).await.unwrap(),
            vec![Bytes::from("one"), Bytes::from("two")]
        );
    }

    #[tokio::test]
    async fn test_flush_empty_mailbox() {
        let mailbox = MemoryMailbox::new();
        let (handle, _rx) = SessionHandle::new(1, "bob".into(), 8);
        assert_eq!(flush_mailbox(&mailbox, &handle).await, 0);
    }

    /// Presence whose offline writes yield before landing, so a reconnect can
    /// slip in between teardown and the write.
    struct SlowOfflinePresence(MemoryPresence);

    #[async_trait]
    impl PresenceStore for SlowOfflinePresence {
        async fn set_online(&self, user: &UserId) -> Result<(), StoreError> {
            self.0.set_online(user).await
        }
        async fn set_offline(&self, user: &UserId) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.set_offline(user).await
        }
        async fn is_online(&self, user: &UserId) -> Result<bool, StoreError> {
            self.0.is_online(user).await
        }
    }

    fn slow_offline_instance() -> Arc<Instance> {
        let backends = Backends {
            presence: Arc::new(SlowOfflinePresence(MemoryPresence::new())),
            ..Backends::memory()
        };
        Arc::new(Instance::new(backends, InstanceConfig::default()))
    }

    #[tokio::test]
    async fn test_reconnect_during_close_stays_online() {
        let instance = slow_offline_instance();
        let bob = UserId::from("bob");
        let (old, _old_rx) = instance.connect(bob.clone()).await;

        let (_, (new, _new_rx)) = tokio::join!(old.close(), instance.connect(bob.clone()));

        assert!(instance.registry().contains(&bob));
        assert!(instance.presence().is_online(&bob).await.unwrap());
        drop(new);
    }

    #[tokio::test]
    async fn test_reconnect_after_drop_stays_online() {
        let instance = Arc::new(Instance::new(Backends::memory(), InstanceConfig::default()));
        let bob = UserId::from("bob");

        let (old, _old_rx) = instance.connect(bob.clone()).await;
        drop(old);
        let (_new, _new_rx) = instance.connect(bob.clone()).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(instance.registry().contains(&bob));
        assert!(instance.presence().is_online(&bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_without_reconnect_goes_offline() {
        let instance = slow_offline_instance();
        let bob = UserId::from("bob");
        let (session, _rx) = instance.connect(bob.clone()).await;

        session.close().await;
        assert!(!instance.registry().contains(&bob));
        assert!(!instance.presence().is_online(&bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_frames() {
        let instance = Arc::new(Instance::new(Backends::memory(), InstanceConfig::default()));
        let (mut session, _rx) = instance.connect("bob".into()).await;
        assert_eq!(session.state(), SessionState::Reading);
        session.state = SessionState::Closed;

        assert!(matches!(
            session
                .handle_frame(Envelope::compose("alice", "hi"))
                .await,
            Err(SessionError::Closed)
        ));
    }
}
