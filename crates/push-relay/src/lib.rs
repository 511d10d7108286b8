//! Push Relay: one long-poll push connection shared by cooperating participants.
//!
//! Responsibilities:
//! - electing, through a lease in shared slots, the participant that owns the connection
//! - keeping that connection alive with separate network and server-error retry tables
//! - fanning received notifications out to every participant with matching push ids
//! - expiring push ids that no participant confirms anymore

pub mod auth;
pub mod broadcast;
pub mod clock;
pub mod commands;
pub mod config;
pub mod connection;
pub mod election;
pub mod error;
pub mod events;
pub mod expiry;
pub mod lease;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod transport;

pub use auth::{AuthProvider, StaticAuth};
pub use broadcast::{Broadcaster, LiveBroadcaster, PollingBroadcaster};
pub use clock::Clock;
pub use commands::{NotificationEnvelope, PushCommand, PushResponse, ServerConfiguration};
pub use config::{ConnectionConfig, RelayConfig};
pub use connection::{ConnectionHandle, ConnectionState};
pub use error::{RelayError, RelayResult};
pub use events::{EventHub, EventKind, RelayEvent, StopReason, Unsubscribe};
pub use lease::{ConnectionLease, LeaseSlot};
pub use registry::{Notification, PushIdRegistry};
pub use relay::{PushRelay, RelayContext};
pub use retry::{start_sequence, RetryHandle};
pub use transport::{HttpTransport, LongPollRequest, LongPollResponse, LongPollTransport, TransportError};
