//! Message bus over Redis pub/sub.
//!
//! Every instance publishes to and subscribes on one channel. Redis delivers
//! messages to subscribers in the order the server executed the `PUBLISH`es,
//! which keeps per-recipient order across instances.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::Client;
use switchboard_core::{BusError, EnvelopeStream, MessageBus};
use switchboard_protocol::{codec, Envelope};
use tracing::{debug, trace, warn};

/// Redis-backed [`MessageBus`].
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: MultiplexedConnection,
    channel: String,
}

impl RedisBus {
    /// Publish through `conn`; subscriptions open their own connections from `client`.
    #[must_use]
    pub fn new(client: Client, conn: MultiplexedConnection, channel: &str) -> Self {
        Self {
            client,
            conn,
            channel: channel.to_string(),
        }
    }

    /// Channel carrying the bus frames.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let frame = codec::encode(envelope)?;
        let mut conn = self.conn.clone();
        let receivers = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(&frame[..])
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        trace!(recipient = %envelope.recipient, receivers, "Published to bus");
        Ok(())
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        debug!(channel = %self.channel, "Subscribed to bus channel");

        // The message stream ends when the pub/sub connection drops.
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match codec::decode(msg.get_payload_bytes()) {
                    Ok(envelope) => Some(Ok(envelope)),
                    Err(e) => {
                        warn!(error = %e, "Skipping undecodable bus frame");
                        None
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

    async fn live(channel: &str) -> Option<RedisBus> {
        let url = std::env::var("SWITCHBOARD_TEST_REDIS_URL").ok()?;
        let client = Client::open(url).ok()?;
        let conn = client.get_multiplexed_tokio_connection().await.ok()?;
        Some(RedisBus::new(client, conn, channel))
    }

    #[tokio::test]
    #[ignore = "needs SWITCHBOARD_TEST_REDIS_URL"]
    async fn test_every_subscriber_sees_every_envelope() {
        let bus = live("switchboard:test-bus").await.expect("SWITCHBOARD_TEST_REDIS_URL not reachable");
        assert_eq!(bus.channel(), "switchboard:test-bus");
        let mut first = bus.subscribe().await.unwrap();
        let mut second = bus.subscribe().await.unwrap();

        for i in 0..3 {
            bus.publish(&Envelope::new("bob", format!("m{i}"))).await.unwrap();
        }

        for sub in [&mut first, &mut second] {
            for i in 0..3 {
                let got = timeout(Duration::from_secs(2), sub.next())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                assert_eq!(got.recipient.as_str(), "bob");
                assert_eq!(got.payload, format!("m{i}").into_bytes());
            }
        }
    }

    #[tokio::test]
    #[ignore = "needs SWITCHBOARD_TEST_REDIS_URL"]
    async fn test_garbage_on_channel_is_skipped() {
        let bus = live("switchboard:test-garbage").await.expect("SWITCHBOARD_TEST_REDIS_URL not reachable");
        let mut sub = bus.subscribe().await.unwrap();

        let mut conn = bus.conn.clone();
        redis::cmd("PUBLISH")
            .arg(bus.channel())
            .arg(&b"\xc1garbage"[..])
            .query_async::<_, usize>(&mut conn)
            .await
            .unwrap();
        bus.publish(&Envelope::new("bob", "fine")).await.unwrap();

        let got = timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&got.payload[..], b"fine");
    }
}
