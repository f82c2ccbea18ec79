//! Presence in Redis.
//!
//! One string key per user, holding `"true"` or `"false"`. A missing key reads as
//! offline.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use switchboard_core::presence::{decode_presence, encode_presence, PresenceStore};
use switchboard_core::StoreError;
use switchboard_protocol::UserId;
use tracing::trace;

/// Redis-backed [`PresenceStore`].
#[derive(Clone)]
pub struct RedisPresence {
    conn: MultiplexedConnection,
}

impl RedisPresence {
    /// Wrap a multiplexed connection.
    #[must_use]
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    async fn set(&self, user: &UserId, online: bool) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(user.as_str())
            .arg(encode_presence(online))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        trace!(user = %user, online, "Presence updated");
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn set_online(&self, user: &UserId) -> Result<(), StoreError> {
        self.set(user, true).await
    }

    async fn set_offline(&self, user: &UserId) -> Result<(), StoreError> {
        self.set(user, false).await
    }

    async fn is_online(&self, user: &UserId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("GET")
            .arg(user.as_str())
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(decode_presence(value.as_deref()))
    }
}
