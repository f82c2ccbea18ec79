//! Client envelopes.
//!
//! Clients send JSON text frames of the form `{"user": "<recipient>", "msg": "<text>"}`.
//! Only the recipient is interpreted by the server; the raw bytes of the frame are what
//! gets forwarded or buffered, so any extra fields survive the trip.

use bytes::Bytes;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Maximum user identifier length in bytes.
pub const MAX_USER_ID_LENGTH: usize = 256;

/// Envelope parsing errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The frame is not a JSON object of the expected shape.
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The recipient field is missing or unusable.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(&'static str),
}

/// Validate a user identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_user_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("User id cannot be empty");
    }
    if id.len() > MAX_USER_ID_LENGTH {
        return Err("User id too long");
    }
    if id.chars().any(char::is_control) {
        return Err("User id contains control characters");
    }
    Ok(())
}

/// A user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id without validation.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a user id, rejecting empty or otherwise invalid identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidRecipient`] if validation fails.
    pub fn parse(id: impl Into<String>) -> Result<Self, EnvelopeError> {
        let id = id.into();
        validate_user_id(&id).map_err(EnvelopeError::InvalidRecipient)?;
        Ok(Self(id))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The JSON shape clients send. `msg` is optional on the wire and only checked for type.
///
/// Only JSON objects are accepted.
#[derive(Debug)]
struct WireEnvelope<'a> {
    user: Cow<'a, str>,
}

/// A string that borrows from the input when it has no escapes.
#[derive(Deserialize)]
struct WireStr<'a>(#[serde(borrow)] Cow<'a, str>);

impl<'de> Deserialize<'de> for WireEnvelope<'de> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvelopeVisitor;

        impl<'de> Visitor<'de> for EnvelopeVisitor {
            type Value = WireEnvelope<'de>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object with a \"user\" string")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut user = None;
                while let Some(WireStr(key)) = map.next_key::<WireStr<'de>>()? {
                    match key.as_ref() {
                        "user" => {
                            if user.is_some() {
                                return Err(de::Error::duplicate_field("user"));
                            }
                            let WireStr(value) = map.next_value::<WireStr<'de>>()?;
                            user = Some(value);
                        }
                        "msg" => {
                            map.next_value::<Option<String>>()?;
                        }
                        _ => {
                            map.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }
                let user = user.ok_or_else(|| de::Error::missing_field("user"))?;
                Ok(WireEnvelope { user })
            }
        }

        deserializer.deserialize_map(EnvelopeVisitor)
    }
}

/// A routed message: who it is for and the raw bytes the sender produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Recipient user.
    pub recipient: UserId,
    /// Raw frame bytes as received from the sender.
    pub payload: Bytes,
}

impl Envelope {
    /// Create an envelope from parts.
    #[must_use]
    pub fn new(recipient: impl Into<UserId>, payload: impl Into<Bytes>) -> Self {
        Self {
            recipient: recipient.into(),
            payload: payload.into(),
        }
    }

    /// Parse a client frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not valid JSON, lacks a `user` string,
    /// or names an invalid recipient.
    pub fn parse(raw: Bytes) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope<'_> = serde_json::from_slice(&raw)?;
        let recipient = UserId::parse(wire.user.into_owned())?;
        Ok(Self {
            recipient,
            payload: raw,
        })
    }

    /// Build the JSON frame a client would send.
    #[must_use]
    pub fn compose(recipient: &str, msg: &str) -> Bytes {
        let value = serde_json::json!({ "user": recipient, "msg": msg });
        Bytes::from(value.to_string())
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}
