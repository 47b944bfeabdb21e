use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::PeerIdentity;

/// What a signaling payload carries. Offers and answers must reach the
/// remote before the candidates that belong to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

/// An addressed negotiation message. The payload is opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub from: PeerIdentity,
    pub to: PeerIdentity,
    pub kind: SignalKind,
    pub payload: Bytes,
}

impl SignalingMessage {
    pub fn new(
        from: PeerIdentity,
        to: PeerIdentity,
        kind: SignalKind,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            from,
            to,
            kind,
            payload: payload.into(),
        }
    }
}
