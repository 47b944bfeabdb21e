use std::time::Duration;

use thiserror::Error;
use transport_signaling::{ConnectError, PeerIdentity};
use transport_webrtc::{ChannelState, FailureReason, TransportError};

use crate::engine::EngineError;
use crate::probe::ProbeError;

/// Bad input. Never worth retrying.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidKey { field: &'static str, reason: String },
    #[error("invalid {field} {value:?}: {reason}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid signaling endpoint: {0}")]
    InvalidEndpoint(#[source] ConnectError),
    #[error("invalid signaling settings: {0}")]
    InvalidSignaling(#[source] ConnectError),
    #[error("remote key is the local public key {0}")]
    SelfPeer(PeerIdentity),
    #[error("local and remote tunnel addresses are both {0}")]
    SameAddress(std::net::Ipv4Addr),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error(transparent)]
    WebRtc(#[from] transport_webrtc::config::ConfigError),
}

/// Why a bootstrap attempt did not produce a running tunnel, or why a
/// running tunnel stopped.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not reach signaling relay: {0}")]
    RelayUnreachable(#[source] ConnectError),
    #[error("peer {remote} did not answer within {waited:?}")]
    PeerDidNotAnswer {
        remote: PeerIdentity,
        waited: Duration,
    },
    #[error("data channel to peer died: {0}")]
    ChannelDied(String),
    #[error("signaling relay lost: {0}")]
    SignalingLost(String),
    #[error("channel negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("tunnel engine: {0}")]
    Engine(#[from] EngineError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("verification probe: {0}")]
    Probe(#[from] ProbeError),
    #[error("tunnel closed")]
    Cancelled,
}

impl BootstrapError {
    /// Transient failures may succeed on a fresh attempt; configuration
    /// mistakes and deliberate closes will not.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BootstrapError::Config(_)
                | BootstrapError::Cancelled
                | BootstrapError::Engine(EngineError::Settings(_))
        )
    }

    pub(crate) fn from_terminal(state: ChannelState, remote: PeerIdentity) -> Self {
        match state {
            ChannelState::Failed(FailureReason::NegotiationTimeout(waited)) => {
                BootstrapError::PeerDidNotAnswer { remote, waited }
            }
            ChannelState::Failed(FailureReason::Signaling(reason)) => {
                BootstrapError::SignalingLost(reason)
            }
            ChannelState::Failed(FailureReason::Negotiation(reason)) => {
                BootstrapError::NegotiationFailed(reason)
            }
            ChannelState::Failed(reason @ FailureReason::ChannelLost(_))
            | ChannelState::Failed(reason @ FailureReason::LivenessLost(_))
            | ChannelState::Failed(reason @ FailureReason::Driver(_)) => {
                BootstrapError::ChannelDied(reason.to_string())
            }
            _ => BootstrapError::Cancelled,
        }
    }
}
