use std::fmt;

use crate::FailureReason;

/// Connection state of one [`ChannelSession`](crate::ChannelSession).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    /// Offer sent, waiting for the answer.
    Offering,
    /// Waiting for the remote's offer.
    AwaitingOffer,
    /// Descriptions exchanged, connectivity checks running.
    Negotiating,
    Open,
    Failed(FailureReason),
    Closed,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Failed(_) | ChannelState::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Offering => "offering",
            ChannelState::AwaitingOffer => "awaiting_offer",
            ChannelState::Negotiating => "negotiating",
            ChannelState::Open => "open",
            ChannelState::Failed(_) => "failed",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}
