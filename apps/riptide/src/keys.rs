use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use boringtun::x25519::{PublicKey, StaticSecret};
use transport_signaling::{IDENTITY_LEN, PeerIdentity};

use crate::error::ConfigError;

/// The local tunnel key pair. The public half doubles as the signaling
/// identity.
#[derive(Clone)]
pub struct KeyPair {
    private: [u8; IDENTITY_LEN],
    public: PeerIdentity,
}

impl KeyPair {
    pub fn from_private(private: [u8; IDENTITY_LEN]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self {
            private: secret.to_bytes(),
            public: PeerIdentity::from_bytes(public.to_bytes()),
        }
    }

    /// Parses a WireGuard-style base64 private key.
    pub fn from_base64(text: &str) -> Result<Self, ConfigError> {
        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|err| ConfigError::InvalidKey {
                field: "key",
                reason: err.to_string(),
            })?;
        let private: [u8; IDENTITY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| ConfigError::InvalidKey {
                    field: "key",
                    reason: format!("expected {IDENTITY_LEN} bytes, got {}", bytes.len()),
                })?;
        Ok(Self::from_private(private))
    }

    pub fn generate() -> Self {
        Self::from_private(rand::random())
    }

    pub fn public(&self) -> PeerIdentity {
        self.public
    }

    pub fn private_bytes(&self) -> [u8; IDENTITY_LEN] {
        self.private
    }

    pub fn private_base64(&self) -> String {
        STANDARD.encode(self.private)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"<redacted>")
            .finish()
    }
}

/// Parses a remote peer's base64 public key.
pub fn parse_public_key(field: &'static str, text: &str) -> Result<PeerIdentity, ConfigError> {
    text.trim()
        .parse()
        .map_err(|err: transport_signaling::IdentityError| ConfigError::InvalidKey {
            field,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "KLuBc6tM/NRV1071bfPiNUxZmMhGBCXfxoDg+A+J7ns=";

    #[test]
    fn private_key_round_trips_through_base64() {
        let pair = KeyPair::from_base64(PRIVATE).unwrap();
        assert_eq!(pair.private_base64(), PRIVATE);
        let again = KeyPair::from_base64(&format!("  {PRIVATE}\n")).unwrap();
        assert_eq!(again.public(), pair.public());
    }

    #[test]
    fn public_key_matches_x25519_derivation() {
        let pair = KeyPair::generate();
        let derived = PublicKey::from(&StaticSecret::from(pair.private_bytes()));
        assert_eq!(pair.public().as_bytes(), derived.as_bytes());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(
            KeyPair::from_base64("not base64!"),
            Err(ConfigError::InvalidKey { field: "key", .. })
        ));
        assert!(matches!(
            KeyPair::from_base64("AAAA"),
            Err(ConfigError::InvalidKey { .. })
        ));
        assert!(matches!(
            parse_public_key("remote-key", "short"),
            Err(ConfigError::InvalidKey {
                field: "remote-key",
                ..
            })
        ));
    }

    #[test]
    fn debug_hides_the_private_key() {
        let pair = KeyPair::from_base64(PRIVATE).unwrap();
        let rendered = format!("{pair:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains(PRIVATE));
    }
}
