use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};
use transport_webrtc::NegotiationRole;

/// Which end of the tunnel this process is. Chosen by configuration, never
/// negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRole {
    /// Sends the channel offer and routes all traffic through the tunnel.
    Initiator,
    /// Waits for the offer and only accepts traffic from the initiator.
    Responder,
}

impl TunnelRole {
    pub fn from_client_flag(client: bool) -> Self {
        if client {
            TunnelRole::Initiator
        } else {
            TunnelRole::Responder
        }
    }

    pub fn negotiation_role(self) -> NegotiationRole {
        match self {
            TunnelRole::Initiator => NegotiationRole::Initiator,
            TunnelRole::Responder => NegotiationRole::Responder,
        }
    }

    /// The engine's allowed-traffic policy for this role.
    pub fn allowed_traffic(self, remote_addr: Ipv4Addr) -> IpNet {
        match self {
            TunnelRole::Initiator => IpNet::V4(Ipv4Net::default()),
            TunnelRole::Responder => IpNet::from(IpAddr::V4(remote_addr)),
        }
    }
}

impl fmt::Display for TunnelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TunnelRole::Initiator => "initiator",
            TunnelRole::Responder => "responder",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_is_unrestricted() {
        let policy = TunnelRole::Initiator.allowed_traffic(Ipv4Addr::new(100, 0, 2, 2));
        assert_eq!(policy.to_string(), "0.0.0.0/0");
    }

    #[test]
    fn responder_allows_only_the_remote() {
        let policy = TunnelRole::Responder.allowed_traffic(Ipv4Addr::new(100, 0, 2, 2));
        assert_eq!(policy.to_string(), "100.0.2.2/32");
        assert!(!policy.contains(&IpAddr::V4(Ipv4Addr::new(100, 0, 2, 3))));
    }

    #[test]
    fn client_flag_selects_initiator() {
        assert_eq!(TunnelRole::from_client_flag(true), TunnelRole::Initiator);
        assert_eq!(
            TunnelRole::from_client_flag(false).negotiation_role(),
            NegotiationRole::Responder
        );
    }
}
