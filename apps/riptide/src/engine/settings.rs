//! Engine configuration and its line-oriented `key=value` text form.
//!
//! ```text
//! private_key=<hex>
//! public_key=<hex>
//! persistent_keepalive_interval=<seconds, 0 disables>
//! endpoint=webrtc://datachannel
//! allowed_ip=0.0.0.0/0
//! ```
//!
//! `allowed_ip` may repeat.

use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;
use transport_signaling::{IDENTITY_LEN, PeerIdentity};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("line {line}: expected key=value")]
    Malformed { line: usize },
    #[error("line {line}: unknown key {key:?}")]
    UnknownKey { line: usize, key: String },
    #[error("line {line}: invalid {key}: {reason}")]
    InvalidValue {
        line: usize,
        key: &'static str,
        reason: String,
    },
    #[error("missing {0}")]
    Missing(&'static str),
}

#[derive(Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub private_key: [u8; IDENTITY_LEN],
    pub public_key: PeerIdentity,
    /// Seconds between keepalives when the tunnel is otherwise idle.
    pub persistent_keepalive: Option<u16>,
    /// Transport endpoint descriptor handed to the bind.
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<IpNet>,
}

impl EngineSettings {
    /// Whether traffic to or from `addr` may cross the tunnel.
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&addr))
    }

    pub fn to_uapi(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "private_key={}", hex::encode(self.private_key));
        let _ = writeln!(out, "public_key={}", self.public_key.to_hex());
        let _ = writeln!(
            out,
            "persistent_keepalive_interval={}",
            self.persistent_keepalive.unwrap_or(0)
        );
        if let Some(endpoint) = &self.endpoint {
            let _ = writeln!(out, "endpoint={endpoint}");
        }
        for net in &self.allowed_ips {
            let _ = writeln!(out, "allowed_ip={net}");
        }
        out
    }

    pub fn from_uapi(text: &str) -> Result<Self, SettingsError> {
        let mut private_key = None;
        let mut public_key = None;
        let mut persistent_keepalive = None;
        let mut endpoint = None;
        let mut allowed_ips = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (key, value) = raw
                .split_once('=')
                .ok_or(SettingsError::Malformed { line })?;
            let invalid = |key: &'static str, reason: String| SettingsError::InvalidValue {
                line,
                key,
                reason,
            };
            match key.trim() {
                "private_key" => {
                    let mut bytes = [0u8; IDENTITY_LEN];
                    hex::decode_to_slice(value.trim(), &mut bytes)
                        .map_err(|err| invalid("private_key", err.to_string()))?;
                    private_key = Some(bytes);
                }
                "public_key" => {
                    let key = PeerIdentity::from_hex(value.trim())
                        .map_err(|err| invalid("public_key", err.to_string()))?;
                    public_key = Some(key);
                }
                "persistent_keepalive_interval" => {
                    let secs: u16 = value
                        .trim()
                        .parse()
                        .map_err(|err: std::num::ParseIntError| {
                            invalid("persistent_keepalive_interval", err.to_string())
                        })?;
                    persistent_keepalive = (secs > 0).then_some(secs);
                }
                "endpoint" => endpoint = Some(value.trim().to_string()),
                "allowed_ip" => {
                    let net: IpNet = value
                        .trim()
                        .parse()
                        .map_err(|err: ipnet::AddrParseError| {
                            invalid("allowed_ip", err.to_string())
                        })?;
                    allowed_ips.push(net);
                }
                other => {
                    return Err(SettingsError::UnknownKey {
                        line,
                        key: other.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            private_key: private_key.ok_or(SettingsError::Missing("private_key"))?,
            public_key: public_key.ok_or(SettingsError::Missing("public_key"))?,
            persistent_keepalive,
            endpoint,
            allowed_ips,
        })
    }
}

impl fmt::Debug for EngineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSettings")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .field("endpoint", &self.endpoint)
            .field("allowed_ips", &self.allowed_ips)
            .finish()
    }
}
