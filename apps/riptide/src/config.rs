use std::net::Ipv4Addr;
use std::time::Duration;

use transport_signaling::{PeerIdentity, SignalingConfig};
use transport_webrtc::WebRtcConfig;

use crate::engine::DEFAULT_INTERFACE_CAPACITY;
use crate::error::ConfigError;
use crate::keys::KeyPair;
use crate::probe::DEFAULT_PROBE_TIMEOUT;
use crate::role::TunnelRole;

pub const DEFAULT_KEEPALIVE_SECS: u16 = 100;

/// Everything one tunnel needs to come up.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub key_pair: KeyPair,
    pub remote: PeerIdentity,
    pub role: TunnelRole,
    /// Relay URL; only dialled by [`crate::bootstrap`].
    pub signal_endpoint: String,
    pub local_addr: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
    /// Persistent keepalive in seconds, `None` to disable.
    pub keepalive: Option<u16>,
    pub probe_timeout: Duration,
    pub interface_capacity: usize,
    pub rtc: WebRtcConfig,
    pub signaling: SignalingConfig,
}

impl TunnelConfig {
    pub fn new(
        key_pair: KeyPair,
        remote: PeerIdentity,
        role: TunnelRole,
        signal_endpoint: impl Into<String>,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
    ) -> Self {
        Self {
            key_pair,
            remote,
            role,
            signal_endpoint: signal_endpoint.into(),
            local_addr,
            remote_addr,
            keepalive: Some(DEFAULT_KEEPALIVE_SECS),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            interface_capacity: DEFAULT_INTERFACE_CAPACITY,
            rtc: WebRtcConfig::new(),
            signaling: SignalingConfig::default(),
        }
    }

    pub fn with_rtc(mut self, rtc: WebRtcConfig) -> Self {
        self.rtc = rtc;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Option<u16>) -> Self {
        self.keepalive = keepalive.filter(|secs| *secs > 0);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_signaling(mut self, signaling: SignalingConfig) -> Self {
        self.signaling = signaling;
        self
    }

    /// Checks what can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote == self.key_pair.public() {
            return Err(ConfigError::SelfPeer(self.remote));
        }
        if self.local_addr == self.remote_addr {
            return Err(ConfigError::SameAddress(self.local_addr));
        }
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "probe timeout",
            });
        }
        if self.interface_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "interface capacity",
            });
        }
        self.rtc.validate()?;
        self.signaling
            .validate()
            .map_err(ConfigError::InvalidSignaling)?;
        Ok(())
    }
}

/// Parses a tunnel address given on the command line.
pub fn parse_addr(field: &'static str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|err: std::net::AddrParseError| ConfigError::InvalidAddress {
            field,
            value: value.to_string(),
            reason: err.to_string(),
        })
}
