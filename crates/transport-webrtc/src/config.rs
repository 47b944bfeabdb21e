use std::time::Duration;

use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "riptide-wg";
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SIGNAL_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_PENDING_SENDS: usize = 64;
pub const DEFAULT_EARLY_SIGNAL_LIMIT: usize = 64;
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Environment switch that drops STUN servers, for same-host tunnels.
pub const LOCALHOST_ONLY_ENV: &str = "RIPTIDE_LOCALHOST_ONLY";

/// Configuration for data-channel sessions.
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    pub data_channel_label: String,
    /// Datagram semantics by default: unordered, no retransmits.
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    /// Bound on the whole negotiation, measured from `open()`.
    pub negotiation_timeout: Duration,
    /// Interval between ping frames on an open channel.
    pub keepalive_interval: Duration,
    /// Silence after which an open channel is declared dead.
    pub liveness_timeout: Duration,
    /// How often an unanswered offer is sent again before the deadline.
    pub signal_retry_interval: Duration,
    pub max_pending_sends: usize,
    pub inbound_capacity: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            ordered: false,
            max_retransmits: Some(0),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            signal_retry_interval: DEFAULT_SIGNAL_RETRY_INTERVAL,
            max_pending_sends: DEFAULT_MAX_PENDING_SENDS,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl WebRtcConfig {
    /// Defaults, minus STUN when `RIPTIDE_LOCALHOST_ONLY` is set.
    pub fn new() -> Self {
        if std::env::var(LOCALHOST_ONLY_ENV).is_ok() {
            Self::localhost()
        } else {
            Self::default()
        }
    }

    /// Create a localhost-only configuration (no STUN/TURN)
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn builder() -> WebRtcConfigBuilder {
        WebRtcConfigBuilder::new()
    }

    /// Checks the invariants the session driver relies on. Sessions refuse
    /// to open with a config that fails this.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_channel_label.is_empty() {
            return Err(ConfigError::EmptyLabel);
        }
        for (field, zero) in [
            ("negotiation timeout", self.negotiation_timeout.is_zero()),
            ("keepalive interval", self.keepalive_interval.is_zero()),
            ("signal retry interval", self.signal_retry_interval.is_zero()),
            ("inbound capacity", self.inbound_capacity == 0),
        ] {
            if zero {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.liveness_timeout <= self.keepalive_interval {
            return Err(ConfigError::LivenessTooShort {
                liveness: self.liveness_timeout,
                keepalive: self.keepalive_interval,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("liveness timeout {liveness:?} must exceed keepalive interval {keepalive:?}")]
    LivenessTooShort {
        liveness: Duration,
        keepalive: Duration,
    },
    #[error("data channel label must not be empty")]
    EmptyLabel,
}

/// Builder for [`WebRtcConfig`]. Starts from the defaults except for ICE
/// servers, which start empty.
pub struct WebRtcConfigBuilder {
    config: WebRtcConfig,
}

impl Default for WebRtcConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WebRtcConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: WebRtcConfig::localhost(),
        }
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.config.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.config.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.config.data_channel_label = label.into();
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.config.ordered = ordered;
        self
    }

    pub fn max_retransmits(mut self, max_retransmits: Option<u16>) -> Self {
        self.config.max_retransmits = max_retransmits;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.config.liveness_timeout = timeout;
        self
    }

    pub fn signal_retry_interval(mut self, interval: Duration) -> Self {
        self.config.signal_retry_interval = interval;
        self
    }

    pub fn max_pending_sends(mut self, max: usize) -> Self {
        self.config.max_pending_sends = max;
        self
    }

    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<WebRtcConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
