//! Shared presence tracking.
//!
//! Presence answers one question for the router: is this user connected to any
//! instance right now? Records are plain booleans keyed by user id and are shared
//! by every instance. An unknown user is offline.

use async_trait::async_trait;
use dashmap::DashMap;
use switchboard_protocol::UserId;
use tracing::debug;

use crate::error::StoreError;

/// Stored value for an online user.
pub const ONLINE: &str = "true";

/// Stored value for an offline user.
pub const OFFLINE: &str = "false";

/// Encode a presence flag the way it is stored.
#[must_use]
pub fn encode_presence(online: bool) -> &'static str {
    if online {
        ONLINE
    } else {
        OFFLINE
    }
}

/// Decode a stored presence value. Missing or unrecognized values count as offline.
#[must_use]
pub fn decode_presence(value: Option<&str>) -> bool {
    value == Some(ONLINE)
}

/// Shared online/offline status per user.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Mark a user online.
    async fn set_online(&self, user: &UserId) -> Result<(), StoreError>;

    /// Mark a user offline.
    async fn set_offline(&self, user: &UserId) -> Result<(), StoreError>;

    /// Check whether a user is online. Unknown users are offline.
    async fn is_online(&self, user: &UserId) -> Result<bool, StoreError>;
}

/// In-process presence store.
///
/// Shared between instances by cloning the `Arc` it lives in.
#[derive(Debug, Default)]
pub struct MemoryPresence {
    records: DashMap<UserId, bool>,
}

impl MemoryPresence {
    /// Create an empty presence store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users currently marked online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.records.iter().filter(|r| *r.value()).count()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_online(&self, user: &UserId) -> Result<(), StoreError> {
        self.records.insert(user.clone(), true);
        debug!(user = %user, "Presence: online");
        Ok(())
    }

    async fn set_offline(&self, user: &UserId) -> Result<(), StoreError> {
        self.records.insert(user.clone(), false);
        debug!(user = %user, "Presence: offline");
        Ok(())
    }

    async fn is_online(&self, user: &UserId) -> Result<bool, StoreError> {
        Ok(self.records.get(user).map(|r| *r.value()).unwrap_or(false))
    }
}
