//! Cross-instance message bus.
//!
//! The bus is one logical broadcast channel. Every instance publishes envelopes
//! for online recipients onto it, and every instance consumes everything that is
//! published, keeping only what belongs to its own connections.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use switchboard_protocol::{codec, Envelope};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::error::BusError;

/// Default in-memory bus capacity.
const DEFAULT_BUS_CAPACITY: usize = 4096;

/// An endless stream of envelopes from a bus subscription.
///
/// An `Err` item or the end of the stream means the subscription is gone.
pub type EnvelopeStream = BoxStream<'static, Result<Envelope, BusError>>;

/// Broadcast publish/subscribe transport between instances.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to every subscriber, keyed by its recipient.
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// Open a subscription receiving every envelope published from now on.
    async fn subscribe(&self) -> Result<EnvelopeStream, BusError>;
}

/// In-process bus backed by a tokio broadcast channel.
///
/// Frames travel encoded, exactly as they would on a networked bus. A single
/// channel delivers in publish order, which keeps per-recipient order.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<Bytes>,
}

impl MemoryBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a bus with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let frame = codec::encode(envelope)?;
        // No subscribers means nobody can deliver it; same as publishing to an idle topic.
        let receivers = self.sender.send(frame).unwrap_or_default();
        trace!(recipient = %envelope.recipient, receivers, "Published to bus");
        Ok(())
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, BusError> {
        let rx = self.sender.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => match codec::decode(&frame) {
                        Ok(envelope) => return Some((Ok(envelope), rx)),
                        Err(e) => warn!(error = %e, "Skipping undecodable bus frame"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bus subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_every_subscriber_sees_every_envelope() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.subscribe().await.unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(&Envelope::new("bob", "to bob")).await.unwrap();
        bus.publish(&Envelope::new("carol", "to carol")).await.unwrap();

        for sub in [&mut first, &mut second] {
            let a = sub.next().await.unwrap().unwrap();
            let b = sub.next().await.unwrap().unwrap();
            assert_eq!(a.recipient.as_str(), "bob");
            assert_eq!(b.recipient.as_str(), "carol");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryBus::new();
        assert!(bus.publish(&Envelope::new("bob", "hi")).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_only_sees_later_messages() {
        let bus = MemoryBus::new();
        let _keepalive = bus.subscribe().await.unwrap();
        bus.publish(&Envelope::new("bob", "early")).await.unwrap();

        let mut late = bus.subscribe().await.unwrap();
        bus.publish(&Envelope::new("bob", "late")).await.unwrap();

        let got = late.next().await.unwrap().unwrap();
        assert_eq!(&got.payload[..], b"late");
        assert!(timeout(Duration::from_millis(20), late.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_going() {
        let bus = MemoryBus::with_capacity(2);
        let mut sub = bus.subscribe().await.unwrap();

        for i in 0..5 {
            bus.publish(&Envelope::new("bob", format!("m{i}")))
                .await
                .unwrap();
        }

        let got = sub.next().await.unwrap().unwrap();
        assert_eq!(&got.payload[..], b"m3");
    }

    #[tokio::test]
    async fn test_garbage_frames_are_skipped() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe().await.unwrap();

        bus.sender.send(Bytes::from_static(b"\xc1garbage")).unwrap();
        bus.publish(&Envelope::new("bob", "fine")).await.unwrap();

        let got = sub.next().await.unwrap().unwrap();
        assert_eq!(&got.payload[..], b"fine");
    }
}
