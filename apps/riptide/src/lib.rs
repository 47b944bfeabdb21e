//! WireGuard over a WebRTC data channel.
//!
//! [`bootstrap`] joins a signaling relay under the local tunnel key,
//! negotiates a data channel to the remote key and hands it to a boringtun
//! engine as its datagram transport. The initiator then proves the tunnel
//! works with an ICMP echo; the responder answers it.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod logging;
pub mod probe;
pub mod role;

pub use bootstrap::{RunningTunnel, bootstrap, bootstrap_with};
pub use config::TunnelConfig;
pub use error::{BootstrapError, ConfigError};
pub use keys::KeyPair;
pub use role::TunnelRole;
