use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const IDENTITY_LEN: usize = 32;

/// A tunnel endpoint's public key. Doubles as the routing key on the relay.
///
/// The text form is standard base64, the same 44-character encoding
/// WireGuard tooling prints for public keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentity([u8; IDENTITY_LEN]);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("peer identity is not valid {encoding}: {reason}")]
    Encoding {
        encoding: &'static str,
        reason: String,
    },
    #[error("peer identity must be {IDENTITY_LEN} bytes, got {0}")]
    Length(usize),
}

impl PeerIdentity {
    pub const fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdentityError> {
        let array: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::Length(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// URL-safe form used inside endpoint descriptors.
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64url(text: &str) -> Result<Self, IdentityError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|err| IdentityError::Encoding {
                encoding: "base64url",
                reason: err.to_string(),
            })?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(text: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(text.trim()).map_err(|err| IdentityError::Encoding {
            encoding: "hex",
            reason: err.to_string(),
        })?;
        Self::from_slice(&bytes)
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        let mut text = self.to_base64();
        text.truncate(8);
        text
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|err| IdentityError::Encoding {
                encoding: "base64",
                reason: err.to_string(),
            })?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({}…)", self.short())
    }
}

impl Serialize for PeerIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PeerIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
