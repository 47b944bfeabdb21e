use std::time::Duration;

use thiserror::Error;

use crate::PeerIdentity;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid relay endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("relay rejected join: {0}")]
    Rejected(String),
    #[error("relay did not acknowledge join within {0:?}")]
    JoinTimeout(Duration),
    #[error("relay closed the connection during join")]
    Closed,
    #[error("{field} must be greater than zero")]
    InvalidConfig { field: &'static str },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("relay connection is not open")]
    NotConnected,
    #[error("message claims sender {actual} but this session belongs to {expected}")]
    ForeignSender {
        expected: PeerIdentity,
        actual: PeerIdentity,
    },
}
