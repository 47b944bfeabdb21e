//! Client side of the riptide signaling relay.
//!
//! A [`SignalingSession`] joins the relay under the local tunnel public key and
//! carries addressed offer, answer and candidate messages between peers.
//! [`LocalRelay`] provides the same service in-process.

mod config;
mod error;
mod identity;
mod local;
mod message;
pub mod protocol;
mod session;

pub use config::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_JOIN_TIMEOUT, SignalingConfig};
pub use error::{ConnectError, SendError};
pub use identity::{IDENTITY_LEN, IdentityError, PeerIdentity};
pub use local::LocalRelay;
pub use message::{SignalKind, SignalingMessage};
pub use session::{SignalingSession, Subscription, relay_url};
