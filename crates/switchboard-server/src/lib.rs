//! # switchboard-server
//!
//! HTTP and WebSocket front end of a Switchboard relay instance.
//!
//! Clients connect with `GET /read?user=<id>` and send JSON envelopes such as
//! `{"user": "bob", "msg": "hi"}`. The server routes each one to the recipient's
//! connection, on whichever instance holds it, or to their offline mailbox.

pub mod config;
pub mod handlers;
pub mod metrics;
