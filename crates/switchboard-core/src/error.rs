//! Errors raised by the shared backends.

use thiserror::Error;

/// Errors from the presence store or the offline mailbox.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The shared store could not be reached or rejected the command.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing a frame failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Opening the subscription failed.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// The subscription broke while consuming.
    #[error("Bus connection lost: {0}")]
    Disconnected(String),

    /// A frame could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] switchboard_protocol::CodecError),
}
