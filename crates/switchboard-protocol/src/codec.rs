//! Codec for frames carried on the message bus.
//!
//! Every instance publishes envelopes to the bus as MessagePack maps of
//! `{v, recipient, payload}`. The payload is a byte string, so client frames pass
//! through untouched whatever characters they contain.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{Envelope, UserId};

/// Maximum bus frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Current bus frame version.
pub const BUS_FRAME_VERSION: u8 = 1;

/// Errors that can occur while encoding or decoding bus frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Frame written by an incompatible peer.
    #[error("Unsupported bus frame version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Serialize)]
struct FrameRef<'a> {
    v: u8,
    recipient: &'a str,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct FrameOwned {
    v: u8,
    recipient: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

/// Encode an envelope as a bus frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let frame = FrameRef {
        v: BUS_FRAME_VERSION,
        recipient: envelope.recipient.as_str(),
        payload: &envelope.payload,
    };
    let data = rmp_serde::to_vec_named(&frame)?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(data.len()));
    }

    Ok(Bytes::from(data))
}

/// Decode a bus frame.
///
/// # Errors
///
/// Returns an error if the data is too large, invalid, or from an unknown version.
pub fn decode(data: &[u8]) -> Result<Envelope, CodecError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(data.len()));
    }

    let frame: FrameOwned = rmp_serde::from_slice(data)?;
    if frame.v != BUS_FRAME_VERSION {
        return Err(CodecError::UnsupportedVersion(frame.v));
    }

    Ok(Envelope {
        recipient: UserId::new(frame.recipient),
        payload: Bytes::from(frame.payload),
    })
}
