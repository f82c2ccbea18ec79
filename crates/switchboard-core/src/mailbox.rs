//! Offline mailbox.
//!
//! Each user has an ordered list of payloads that arrived while they were offline.
//! `append` adds to the tail; `drain_all` takes the whole list and clears it in one
//! step, so an append racing a drain lands either in that drain or in the next one.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use switchboard_protocol::UserId;
use tracing::trace;

use crate::error::StoreError;

/// Shared per-user queue of undelivered payloads.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Add a payload to the tail of a user's mailbox, creating it if needed.
    async fn append(&self, user: &UserId, payload: Bytes) -> Result<(), StoreError>;

    /// Take every pending payload in arrival order and clear the mailbox.
    ///
    /// An empty or missing mailbox yields an empty vector.
    async fn drain_all(&self, user: &UserId) -> Result<Vec<Bytes>, StoreError>;

    /// Number of pending payloads.
    async fn len(&self, user: &UserId) -> Result<usize, StoreError>;
}

/// In-process mailbox.
///
/// Appends and drains for one user serialize on the map shard holding that user,
/// which makes `drain_all` atomic with respect to `append`.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    queues: DashMap<UserId, Vec<Bytes>>,
}

impl MemoryMailbox {
    /// Create an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn append(&self, user: &UserId, payload: Bytes) -> Result<(), StoreError> {
        let mut queue = self.queues.entry(user.clone()).or_default();
        queue.push(payload);
        trace!(user = %user, pending = queue.len(), "Mailbox append");
        Ok(())
    }

    async fn drain_all(&self, user: &UserId) -> Result<Vec<Bytes>, StoreError> {
        let drained = self
            .queues
            .remove(user)
            .map(|(_, queue)| queue)
            .unwrap_or_default();
        trace!(user = %user, drained = drained.len(), "Mailbox drain");
        Ok(drained)
    }

    async fn len(&self, user: &UserId) -> Result<usize, StoreError> {
        Ok(self.queues.get(user).map(|q| q.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_append_preserves_order() {
        let mailbox = MemoryMailbox::new();
        let bob = UserId::from("bob");

        mailbox.append(&bob, Bytes::from_static(b"one")).await.unwrap();
        mailbox.append(&bob, Bytes::from_static(b"two|with|pipes")).await.unwrap();
        mailbox.append(&bob, Bytes::from_static(b"three")).await.unwrap();
        assert_eq!(mailbox.len(&bob).await.unwrap(), 3);

        let drained = mailbox.drain_all(&bob).await.unwrap();
        assert_eq!(
            drained,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two|with|pipes"),
                Bytes::from_static(b"three"),
            ]
        );
        assert_eq!(mailbox.len(&bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_empty() {
        let mailbox = MemoryMailbox::new();
        assert!(mailbox.drain_all(&"nobody".into()).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_kept() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let bob = UserId::from("bob");

        let mut handles = Vec::new();
        for sender in 0..32 {
            let mailbox = Arc::clone(&mailbox);
            let bob = bob.clone();
            handles.push(tokio::spawn(async move {
                mailbox
                    .append(&bob, Bytes::from(format!("from-{sender}")))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let drained = mailbox.drain_all(&bob).await.unwrap();
        let unique: HashSet<_> = drained.iter().cloned().collect();
        assert_eq!(drained.len(), 32);
        assert_eq!(unique.len(), 32);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_drain_racing_append_loses_nothing() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let bob = UserId::from("bob");
        const TOTAL: usize = 2_000;

        let writer = {
            let mailbox = Arc::clone(&mailbox);
            let bob = bob.clone();
            tokio::spawn(async move {
                for i in 0..TOTAL {
                    mailbox
                        .append(&bob, Bytes::from(i.to_string()))
                        .await
                        .unwrap();
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut seen = Vec::new();
        while !writer.is_finished() {
            seen.extend(mailbox.drain_all(&bob).await.unwrap());
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        seen.extend(mailbox.drain_all(&bob).await.unwrap());

        let expected: Vec<Bytes> = (0..TOTAL).map(|i| Bytes::from(i.to_string())).collect();
        assert_eq!(seen, expected);
    }
}
