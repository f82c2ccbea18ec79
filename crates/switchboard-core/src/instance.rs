//! One running relay instance.
//!
//! An instance owns its connection registry and relay, and shares presence,
//! mailbox and bus with every other instance through [`Backends`].

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_protocol::UserId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bus::{MemoryBus, MessageBus};
use crate::mailbox::{Mailbox, MemoryMailbox};
use crate::presence::{MemoryPresence, PresenceStore};
use crate::registry::ConnectionRegistry;
use crate::relay::{OutboundRelay, RelayError, RelayStats};
use crate::router::Router;
use crate::session::Session;

/// Default outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Instance configuration.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Payloads that may wait for a connection's writer before the relay drops.
    pub outbound_queue_capacity: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

/// The state shared between instances.
#[derive(Clone)]
pub struct Backends {
    /// Online/offline status per user.
    pub presence: Arc<dyn PresenceStore>,
    /// Offline mailboxes.
    pub mailbox: Arc<dyn Mailbox>,
    /// Cross-instance bus.
    pub bus: Arc<dyn MessageBus>,
}

impl Backends {
    /// In-process backends. Clones share state, so several instances in one
    /// process behave like a cluster.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            presence: Arc::new(MemoryPresence::new()),
            mailbox: Arc::new(MemoryMailbox::new()),
            bus: Arc::new(MemoryBus::new()),
        }
    }
}

/// Instance statistics.
#[derive(Debug, Clone)]
pub struct InstanceStats {
    /// Live local sessions.
    pub sessions: usize,
    /// Envelopes consumed from the bus.
    pub relay_received: u64,
    /// Envelopes handed to local connections.
    pub relay_delivered: u64,
    /// Envelopes dropped because a local connection could not take them.
    pub relay_dropped: u64,
    /// Offline messages flushed to connecting users.
    pub mailbox_drained: u64,
}

/// A relay instance.
pub struct Instance {
    registry: Arc<ConnectionRegistry>,
    backends: Backends,
    router: Router,
    relay_stats: Arc<RelayStats>,
    drained: Arc<AtomicU64>,
    config: InstanceConfig,
}

impl Instance {
    /// Create an instance over the given backends.
    #[must_use]
    pub fn new(backends: Backends, config: InstanceConfig) -> Self {
        info!("Creating instance with config: {:?}", config);
        let router = Router::new(
            Arc::clone(&backends.presence),
            Arc::clone(&backends.mailbox),
            Arc::clone(&backends.bus),
        );
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            backends,
            router,
            relay_stats: Arc::new(RelayStats::default()),
            drained: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Subscribe to the bus and start the outbound relay.
    ///
    /// Call this before accepting connections. The returned task only finishes
    /// when the relay fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription cannot be opened.
    pub async fn start_relay(&self) -> Result<JoinHandle<Result<(), RelayError>>, RelayError> {
        let relay = OutboundRelay::subscribe(
            self.backends.bus.as_ref(),
            Arc::clone(&self.registry),
            Arc::clone(&self.relay_stats),
        )
        .await?;
        Ok(relay.spawn())
    }

    /// Open a session for a newly connected user.
    ///
    /// Returns the session and the outbound queue its connection writer must drain.
    pub async fn connect(self: &Arc<Self>, user: UserId) -> (Session, mpsc::Receiver<Bytes>) {
        Session::open(Arc::clone(self), user).await
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the presence store.
    #[must_use]
    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.backends.presence
    }

    /// Get the offline mailbox.
    #[must_use]
    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.backends.mailbox
    }

    pub(crate) fn drained_counter(&self) -> &Arc<AtomicU64> {
        &self.drained
    }

    /// Get the router.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    /// Get instance statistics.
    #[must_use]
    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            sessions: self.registry.len(),
            relay_received: self.relay_stats.received(),
            relay_delivered: self.relay_stats.delivered(),
            relay_dropped: self.relay_stats.dropped(),
            mailbox_drained: self.drained.load(Ordering::Relaxed),
        }
    }
}
