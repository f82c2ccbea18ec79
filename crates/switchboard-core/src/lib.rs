//! # switchboard-core
//!
//! Core routing for the Switchboard message relay.
//!
//! This crate provides the building blocks of one relay instance:
//!
//! - **Registry** - the users connected to this instance and their write handles
//! - **Presence** - shared online/offline status per user
//! - **Mailbox** - shared per-user queue of messages sent while offline
//! - **Bus** - broadcast transport connecting all instances
//! - **Router** - the per-message decision between mailbox and bus
//! - **Session** - the lifecycle of one client connection
//! - **Relay** - the per-instance consumer delivering bus traffic locally
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐    ┌─────────┐    ┌──────────┐
//! │ Session │───▶│ Router  │───▶│ Mailbox  │ (recipient offline)
//! └─────────┘    └─────────┘    └──────────┘
//!                     │  presence lookup
//!                     ▼
//!                ┌─────────┐    ┌─────────┐    ┌──────────┐
//!                │   Bus   │───▶│  Relay  │───▶│ Registry │──▶ socket
//!                └─────────┘    └─────────┘    └──────────┘
//!                      (every instance)
//! ```

pub mod bus;
pub mod error;
pub mod instance;
pub mod mailbox;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;

pub use bus::{EnvelopeStream, MemoryBus, MessageBus};
pub use error::{BusError, StoreError};
pub use instance::{Backends, Instance, InstanceConfig, InstanceStats};
pub use mailbox::{Mailbox, MemoryMailbox};
pub use presence::{MemoryPresence, PresenceStore};
pub use registry::{ConnectionRegistry, DeliveryError, SessionHandle, SessionId};
pub use relay::{Delivery, OutboundRelay, RelayError, RelayStats};
pub use router::{Route, RouteError, Router};
pub use session::{Session, SessionError, SessionState};
pub use switchboard_protocol::{Envelope, UserId};
