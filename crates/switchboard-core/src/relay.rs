//! Outbound relay.
//!
//! One relay runs per instance. It consumes the whole bus and hands each envelope
//! to the recipient's local session if there is one. Envelopes for users attached
//! elsewhere are dropped here and delivered by the instance that holds them.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_protocol::Envelope;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::bus::{EnvelopeStream, MessageBus};
use crate::error::BusError;
use crate::registry::{ConnectionRegistry, DeliveryError};

/// Relay errors. Every one of them ends the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The bus subscription could not be opened.
    #[error("Bus subscription failed: {0}")]
    Subscribe(#[source] BusError),

    /// The bus subscription broke.
    #[error("Bus consumption failed: {0}")]
    Consume(#[source] BusError),

    /// The bus subscription ended.
    #[error("Bus subscription ended")]
    SubscriptionEnded,
}

/// Outcome of offering one envelope to the local registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's connection.
    Delivered,
    /// Recipient is not connected here.
    NotLocal,
    /// Recipient is here but its connection could not take the payload.
    Dropped,
}

/// Running counters for a relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    delivered: AtomicU64,
    not_local: AtomicU64,
    dropped: AtomicU64,
}

impl RelayStats {
    fn record(&self, delivery: Delivery) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let counter = match delivery {
            Delivery::Delivered => &self.delivered,
            Delivery::NotLocal => &self.not_local,
            Delivery::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Envelopes consumed from the bus.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Envelopes handed to a local connection.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Envelopes for users not connected here.
    #[must_use]
    pub fn not_local(&self) -> u64 {
        self.not_local.load(Ordering::Relaxed)
    }

    /// Envelopes a local connection could not accept.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Offer an envelope to its recipient's local session.
///
/// Never waits: a full outbound queue drops the payload so one slow connection
/// cannot hold up the bus for everyone else.
pub fn deliver(registry: &ConnectionRegistry, envelope: Envelope) -> Delivery {
    let Some(session) = registry.lookup(&envelope.recipient) else {
        trace!(recipient = %envelope.recipient, "Recipient not local");
        return Delivery::NotLocal;
    };

    match session.try_deliver(envelope.payload) {
        Ok(()) => {
            trace!(recipient = %envelope.recipient, session = session.id(), "Delivered");
            Delivery::Delivered
        }
        Err(DeliveryError::QueueFull) => {
            warn!(recipient = %envelope.recipient, session = session.id(), "Outbound queue full, dropping message");
            Delivery::Dropped
        }
        Err(DeliveryError::Closed) => {
            warn!(recipient = %envelope.recipient, session = session.id(), "Connection gone, dropping message");
            Delivery::Dropped
        }
    }
}

/// The per-instance bus consumer.
pub struct OutboundRelay {
    stream: EnvelopeStream,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<RelayStats>,
}

impl OutboundRelay {
    /// Subscribe to the bus. Envelopes published after this returns will be seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened.
    pub async fn subscribe(
        bus: &dyn MessageBus,
        registry: Arc<ConnectionRegistry>,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError> {
        let stream = bus.subscribe().await.map_err(RelayError::Subscribe)?;
        info!("Outbound relay subscribed to bus");
        Ok(Self {
            stream,
            registry,
            stats,
        })
    }

    /// Consume the bus until the subscription fails or ends.
    ///
    /// This only returns on failure.
    pub async fn run(mut self) -> Result<(), RelayError> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(envelope) => {
                    let delivery = deliver(&self.registry, envelope);
                    self.stats.record(delivery);
                }
                Err(e) => {
                    error!(error = %e, "Bus consumption failed, stopping relay");
                    return Err(RelayError::Consume(e));
                }
            }
        }

        error!("Bus subscription ended, stopping relay");
        Err(RelayError::SubscriptionEnded)
    }

    /// Run the relay on its own task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<Result<(), RelayError>> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::registry::SessionHandle;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_deliver_local_and_remote() {
        let registry = ConnectionRegistry::new();
        let (bob, mut rx) = SessionHandle::new(1, "bob".into(), 4);
        registry.register(bob);

        assert_eq!(
            deliver(&registry, Envelope::new("bob", "hi")),
            Delivery::Delivered
        );
        assert_eq!(
            deliver(&registry, Envelope::new("carol", "hi")),
            Delivery::NotLocal
        );
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_deliver_to_full_queue_drops() {
        let registry = ConnectionRegistry::new();
        let (bob, _rx) = SessionHandle::new(1, "bob".into(), 1);
        registry.register(bob);

        assert_eq!(
            deliver(&registry, Envelope::new("bob", "one")),
            Delivery::Delivered
        );
        assert_eq!(
            deliver(&registry, Envelope::new("bob", "two")),
            Delivery::Dropped
        );
    }

    #[tokio::test]
    async fn test_relay_filters_by_registry() {
        let bus = MemoryBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(RelayStats::default());
        let (bob, mut rx) = SessionHandle::new(1, "bob".into(), 8);
        registry.register(bob);

        let relay = OutboundRelay::subscribe(&bus, Arc::clone(&registry), Arc::clone(&stats))
            .await
            .unwrap()
            .spawn();

        bus.publish(&Envelope::new("carol", "not here")).await.unwrap();
        bus.publish(&Envelope::new("bob", "first")).await.unwrap();
        bus.publish(&Envelope::new("bob", "second")).await.unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(Bytes::from_static(b"first")));
        assert_eq!(second, Some(Bytes::from_static(b"second")));

        timeout(Duration::from_secs(1), async {
            while stats.received() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stats.delivered(), 2);
        assert_eq!(stats.not_local(), 1);
        assert_eq!(stats.received(), 3);
        relay.abort();
    }

    struct BrokenBus;

    #[async_trait]
    impl MessageBus for BrokenBus {
        async fn publish(&self, _: &Envelope) -> Result<(), BusError> {
            Ok(())
        }

        async fn subscribe(&self) -> Result<EnvelopeStream, BusError> {
            let items = vec![
                Ok(Envelope::new("bob", "hi")),
                Err(BusError::Disconnected("reset by peer".into())),
            ];
            Ok(stream::iter(items).boxed())
        }
    }

    #[tokio::test]
    async fn test_consume_failure_stops_relay() {
        let registry = Arc::new(ConnectionRegistry::new());
        let stats = Arc::new(RelayStats::default());
        let relay = OutboundRelay::subscribe(&BrokenBus, registry, Arc::clone(&stats))
            .await
            .unwrap();

        assert!(matches!(relay.run().await, Err(RelayError::Consume(_))));
        assert_eq!(stats.not_local(), 1);
    }

    #[tokio::test]
    async fn test_subscription_end_stops_relay() {
        struct ClosedBus;

        #[async_trait]
        impl MessageBus for ClosedBus {
            async fn publish(&self, _: &Envelope) -> Result<(), BusError> {
                Ok(())
            }

            async fn subscribe(&self) -> Result<EnvelopeStream, BusError> {
                Ok(stream::empty::<Result<Envelope, BusError>>().boxed())
            }
        }

        let relay = OutboundRelay::subscribe(
            &ClosedBus,
            Arc::new(ConnectionRegistry::new()),
            Arc::new(RelayStats::default()),
        )
        .await
        .unwrap();

        assert!(matches!(relay.run().await, Err(RelayError::SubscriptionEnded)));
    }
}
