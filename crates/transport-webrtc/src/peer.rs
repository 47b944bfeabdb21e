use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::NegotiationError;

/// Which side of the offer/answer exchange a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationRole {
    Initiator,
    Responder,
}

/// Callbacks from the peer connection, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate to trickle to the remote.
    LocalCandidate(Bytes),
    ChannelOpen,
    Message(Bytes),
    ChannelClosed,
    ConnectionFailed(String),
}

/// A single peer connection with one data channel.
///
/// Descriptions and candidates cross this boundary as opaque bytes so the
/// session state machine does not depend on the WebRTC stack in use.
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Creates an offer and applies it locally.
    async fn create_offer(&self) -> Result<Bytes, NegotiationError>;
    /// Applies a remote offer and returns the answer, applied locally.
    async fn accept_offer(&self, offer: Bytes) -> Result<Bytes, NegotiationError>;
    async fn apply_answer(&self, answer: Bytes) -> Result<(), NegotiationError>;
    async fn add_remote_candidate(&self, candidate: Bytes) -> Result<(), NegotiationError>;
    /// Writes one whole message on the data channel.
    async fn send(&self, message: Bytes) -> Result<(), NegotiationError>;
    async fn close(&self);
}

pub struct PeerHandle {
    pub peer: Arc<dyn RtcPeer>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(&self, role: NegotiationRole) -> Result<PeerHandle, NegotiationError>;
}
