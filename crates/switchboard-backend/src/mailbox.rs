//! Offline mailboxes in Redis.
//!
//! Each mailbox is a list at `user + suffix`. Appends are `RPUSH`; a drain reads
//! and deletes the list inside one `MULTI`/`EXEC`, so a concurrent `RPUSH` is
//! either part of the drained range or lands in a fresh list for the next drain.

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use switchboard_core::{Mailbox, StoreError};
use switchboard_protocol::UserId;
use tracing::trace;

/// Redis-backed [`Mailbox`].
#[derive(Clone)]
pub struct RedisMailbox {
    conn: MultiplexedConnection,
    suffix: String,
}

impl RedisMailbox {
    /// Wrap a multiplexed connection, keying lists as `user + suffix`.
    #[must_use]
    pub fn new(conn: MultiplexedConnection, suffix: &str) -> Self {
        Self {
            conn,
            suffix: suffix.to_string(),
        }
    }

    fn key(&self, user: &UserId) -> String {
        mailbox_key(user, &self.suffix)
    }
}

/// Key of a user's mailbox list.
#[must_use]
pub fn mailbox_key(user: &UserId, suffix: &str) -> String {
    let mut key = String::with_capacity(user.as_str().len() + suffix.len());
    key.push_str(user.as_str());
    key.push_str(suffix);
    key
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl Mailbox for RedisMailbox {
    async fn append(&self, user: &UserId, payload: Bytes) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pending = redis::cmd("RPUSH")
            .arg(self.key(user))
            .arg(&payload[..])
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(unavailable)?;
        trace!(user = %user, pending, "Mailbox append");
        Ok(())
    }

    async fn drain_all(&self, user: &UserId) -> Result<Vec<Bytes>, StoreError> {
        let key = self.key(user);
        let mut conn = self.conn.clone();
        let (entries,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async::<_, (Vec<Vec<u8>>,)>(&mut conn)
            .await
            .map_err(unavailable)?;
        trace!(user = %user, drained = entries.len(), "Mailbox drain");
        Ok(entries.into_iter().map(Bytes::from).collect())
    }

    async fn len(&self, user: &UserId) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(self.key(user))
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(unavailable)
    }
}
