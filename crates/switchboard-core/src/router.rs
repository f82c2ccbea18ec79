//! Routing decision for inbound messages.
//!
//! The router looks up the recipient's presence and either buffers the payload in
//! the recipient's mailbox (offline) or publishes the envelope on the bus (online).
//! There is no shortcut for recipients connected to the same instance: they are
//! reached through the bus like everyone else.

use std::sync::Arc;
use switchboard_protocol::Envelope;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::bus::MessageBus;
use crate::error::{BusError, StoreError};
use crate::mailbox::Mailbox;
use crate::presence::PresenceStore;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// Buffering in the mailbox failed; the message is lost.
    #[error("Mailbox append failed: {0}")]
    Mailbox(#[source] StoreError),

    /// Publishing on the bus failed; the message is lost.
    #[error("Bus publish failed: {0}")]
    Publish(#[source] BusError),
}

/// Where a message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Appended to the recipient's offline mailbox.
    Buffered,
    /// Published on the bus for whichever instance holds the recipient.
    Published,
    /// Lost to a backend failure.
    Dropped,
}

impl Route {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Buffered => "buffered",
            Route::Published => "published",
            Route::Dropped => "dropped",
        }
    }
}

/// Routes envelopes to the mailbox or the bus.
#[derive(Clone)]
pub struct Router {
    presence: Arc<dyn PresenceStore>,
    mailbox: Arc<dyn Mailbox>,
    bus: Arc<dyn MessageBus>,
}

impl Router {
    /// Create a router over the shared backends.
    #[must_use]
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        mailbox: Arc<dyn Mailbox>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            presence,
            mailbox,
            bus,
        }
    }

    /// Route one envelope.
    ///
    /// A presence lookup that fails is treated as "offline", so the message is
    /// buffered rather than published into the void.
    ///
    /// # Errors
    ///
    /// Returns an error if the chosen backend fails; the message is then lost.
    pub async fn route(&self, envelope: Envelope) -> Result<Route, RouteError> {
        let online = match self.presence.is_online(&envelope.recipient).await {
            Ok(online) => online,
            Err(e) => {
                warn!(recipient = %envelope.recipient, error = %e, "Presence lookup failed, buffering");
                false
            }
        };

        if online {
            self.bus
                .publish(&envelope)
                .await
                .map_err(RouteError::Publish)?;
            trace!(recipient = %envelope.recipient, "Published");
            Ok(Route::Published)
        } else {
            let recipient = envelope.recipient;
            self.mailbox
                .append(&recipient, envelope.payload)
                .await
                .map_err(RouteError::Mailbox)?;
            debug!(recipient = %recipient, "Buffered for offline recipient");
            Ok(Route::Buffered)
        }
    }
}
