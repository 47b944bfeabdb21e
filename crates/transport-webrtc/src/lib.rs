//! Datagram transport over a negotiated WebRTC data channel.
//!
//! [`DataChannelBind`] gives a tunnel engine the socket-like [`Bind`]
//! contract. Underneath, a [`ChannelSession`] negotiates one data channel to
//! one remote peer through a [`SignalRouter`] sharing a single relay
//! connection, then keeps it alive with ping frames until it is closed or
//! dies.

mod bind;
pub mod config;
mod error;
mod frame;
mod memory;
mod peer;
mod router;
mod rtc;
mod session;
mod state;

pub use bind::{Bind, DATACHANNEL_ENDPOINT, DataChannelBind, ENDPOINT_SCHEME, Endpoint};
pub use config::{WebRtcConfig, WebRtcConfigBuilder};
pub use error::{FailureReason, NegotiationError, SendError, TransportError};
pub use memory::{MemoryLink, MemoryNetwork, MemoryPeerFactory};
pub use peer::{NegotiationRole, PeerEvent, PeerFactory, PeerHandle, RtcPeer};
pub use router::{SignalInbox, SignalRouter};
pub use rtc::WebRtcPeerFactory;
pub use session::ChannelSession;
pub use state::ChannelState;
