//! # switchboard-backend
//!
//! Shared backends for running several Switchboard instances side by side.
//!
//! `switchboard-core` defines the [`PresenceStore`], [`Mailbox`] and [`MessageBus`]
//! traits and ships in-memory versions of each. Those only work inside one process.
//! This crate provides networked implementations that every instance can share:
//!
//! - **Redis** (feature `redis`, on by default) - presence as plain string keys,
//!   mailboxes as lists, and the bus as one pub/sub channel
//!
//! ```rust,ignore
//! use switchboard_backend::{connect_redis, RedisOptions};
//! use switchboard_core::{Instance, InstanceConfig};
//!
//! let backends = connect_redis(&RedisOptions::new("redis://127.0.0.1/")).await?;
//! let instance = Instance::new(backends, InstanceConfig::default());
//! ```
//!
//! [`PresenceStore`]: switchboard_core::PresenceStore
//! [`Mailbox`]: switchboard_core::Mailbox
//! [`MessageBus`]: switchboard_core::MessageBus

#[cfg(feature = "redis")]
pub mod bus;
#[cfg(feature = "redis")]
pub mod mailbox;
#[cfg(feature = "redis")]
pub mod presence;

#[cfg(feature = "redis")]
pub use bus::RedisBus;
#[cfg(feature = "redis")]
pub use mailbox::RedisMailbox;
#[cfg(feature = "redis")]
pub use presence::RedisPresence;

#[cfg(feature = "redis")]
use std::sync::Arc;
#[cfg(feature = "redis")]
use switchboard_core::{Backends, StoreError};
#[cfg(feature = "redis")]
use tracing::info;

/// Default pub/sub channel carrying bus frames.
pub const DEFAULT_BUS_CHANNEL: &str = "switchboard:bus";

/// Default suffix appended to a user ID to form its mailbox key.
pub const DEFAULT_MAILBOX_SUFFIX: &str = ":mailbox";

/// Where and how the shared state lives in Redis.
#[derive(Debug, Clone)]
pub struct RedisOptions {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Pub/sub channel for bus frames.
    pub bus_channel: String,
    /// Suffix of per-user mailbox list keys.
    pub mailbox_suffix: String,
}

impl RedisOptions {
    /// Options for `url` with the default channel and key layout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bus_channel: DEFAULT_BUS_CHANNEL.to_string(),
            mailbox_suffix: DEFAULT_MAILBOX_SUFFIX.to_string(),
        }
    }
}

/// Connect all three backends to one Redis server.
///
/// Presence and mailbox share a multiplexed connection. The bus opens its own
/// pub/sub connection per subscription.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the server cannot be reached.
#[cfg(feature = "redis")]
pub async fn connect_redis(options: &RedisOptions) -> Result<Backends, StoreError> {
    let client = redis::Client::open(options.url.as_str())
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    let conn = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

    info!(url = %options.url, channel = %options.bus_channel, "Connected to Redis");

    Ok(Backends {
        presence: Arc::new(RedisPresence::new(conn.clone())),
        mailbox: Arc::new(RedisMailbox::new(conn.clone(), &options.mailbox_suffix)),
        bus: Arc::new(RedisBus::new(client, conn, &options.bus_channel)),
    })
}
