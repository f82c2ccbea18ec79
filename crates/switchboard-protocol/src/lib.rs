//! # switchboard-protocol
//!
//! Wire formats for the Switchboard message relay.
//!
//! Two formats live here:
//!
//! - **Envelope** - the JSON frame clients send: `{"user": "<recipient>", "msg": "<text>"}`
//! - **Bus frame** - the MessagePack frame instances exchange over the message bus
//!
//! ## Example
//!
//! ```rust
//! use switchboard_protocol::{codec, Envelope};
//!
//! let raw = Envelope::compose("bob", "hi");
//! let envelope = Envelope::parse(raw).unwrap();
//!
//! let frame = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&frame).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, CodecError};
pub use envelope::{validate_user_id, Envelope, EnvelopeError, UserId};
