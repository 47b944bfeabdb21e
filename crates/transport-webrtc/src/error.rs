use std::time::Duration;

use thiserror::Error;
use transport_signaling::PeerIdentity;

/// Why a session ended in `Failed`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("no usable channel within {0:?}")]
    NegotiationTimeout(Duration),
    #[error("no traffic from peer for {0:?}")]
    LivenessLost(Duration),
    #[error("data channel lost: {0}")]
    ChannelLost(String),
    #[error("signaling unavailable: {0}")]
    Signaling(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("session driver stopped: {0}")]
    Driver(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("a live session already exists for peer {0}")]
    SessionActive(PeerIdentity),
    #[error("transport closed")]
    Closed,
    #[error("invalid endpoint descriptor {descriptor:?}: {reason}")]
    InvalidEndpoint { descriptor: String, reason: String },
    #[error("peer setup failed: {0}")]
    Setup(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ConfigError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transport has not been opened")]
    NotOpen,
    #[error("pending send queue is full ({0} packets)")]
    QueueFull(usize),
    #[error("session failed: {0}")]
    Failed(FailureReason),
    #[error("session closed")]
    Closed,
    #[error("endpoint {0} is not bound to this transport")]
    WrongEndpoint(String),
    #[error("data channel write failed: {0}")]
    Channel(String),
}

/// Failures reported by a peer connection implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{0}")]
    Rtc(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("data channel is not available")]
    ChannelUnavailable,
    #[error("peer connection closed")]
    Closed,
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Rtc(err.to_string())
    }
}
