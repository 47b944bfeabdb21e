use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use transport_webrtc::WebRtcConfig;
use transport_webrtc::config::DEFAULT_STUN_SERVER;

use crate::config::{DEFAULT_KEEPALIVE_SECS, TunnelConfig, parse_addr};
use crate::error::ConfigError;
use crate::keys::{KeyPair, parse_public_key};
use crate::logging::{LogConfig, LogLevel};
use crate::role::TunnelRole;

#[derive(Parser, Debug, Clone)]
#[command(name = "riptide", about = "WireGuard tunnel over a WebRTC data channel")]
pub struct Cli {
    /// Local WireGuard private key (base64)
    #[arg(long, env = "RIPTIDE_KEY", hide_env_values = true)]
    pub key: String,

    /// Remote peer's WireGuard public key (base64)
    #[arg(long = "remote-key", env = "RIPTIDE_REMOTE_KEY")]
    pub remote_key: String,

    /// Signaling relay WebSocket URL
    #[arg(long = "signal-endpoint", env = "RIPTIDE_SIGNAL_ENDPOINT")]
    pub signal_endpoint: String,

    /// Local tunnel address
    #[arg(long, env = "RIPTIDE_IP")]
    pub ip: String,

    /// Remote tunnel address
    #[arg(long = "remote-ip", env = "RIPTIDE_REMOTE_IP")]
    pub remote_ip: String,

    /// Act as the initiator: send the offer and probe the remote
    #[arg(long, env = "RIPTIDE_CLIENT")]
    pub client: bool,

    /// Persistent keepalive in seconds, 0 disables
    #[arg(long = "keepalive-secs", env = "RIPTIDE_KEEPALIVE_SECS", default_value_t = DEFAULT_KEEPALIVE_SECS)]
    pub keepalive_secs: u16,

    #[arg(long = "negotiation-timeout-secs", env = "RIPTIDE_NEGOTIATION_TIMEOUT_SECS", default_value_t = 30)]
    pub negotiation_timeout_secs: u64,

    #[arg(long = "probe-timeout-secs", env = "RIPTIDE_PROBE_TIMEOUT_SECS", default_value_t = 10)]
    pub probe_timeout_secs: u64,

    /// STUN/TURN server URL, repeatable
    #[arg(long = "ice-server", env = "RIPTIDE_ICE_SERVERS", value_delimiter = ',')]
    pub ice_servers: Vec<String>,

    /// Skip STUN entirely, for peers on the same host
    #[arg(long = "localhost-only", env = "RIPTIDE_LOCALHOST_ONLY")]
    pub localhost_only: bool,

    /// Re-run the bootstrap with backoff after transient failures
    #[arg(long, env = "RIPTIDE_RETRY")]
    pub retry: bool,

    #[arg(long = "log-level", value_enum, env = "RIPTIDE_LOG_LEVEL", default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long = "log-file", env = "RIPTIDE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }

    pub fn role(&self) -> TunnelRole {
        TunnelRole::from_client_flag(self.client)
    }

    pub fn tunnel_config(&self) -> Result<TunnelConfig, ConfigError> {
        let key_pair = KeyPair::from_base64(&self.key)?;
        let remote = parse_public_key("remote-key", &self.remote_key)?;
        let local_addr = parse_addr("ip", &self.ip)?;
        let remote_addr = parse_addr("remote-ip", &self.remote_ip)?;
        if self.negotiation_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "negotiation timeout",
            });
        }

        let config = TunnelConfig::new(
            key_pair,
            remote,
            self.role(),
            self.signal_endpoint.trim(),
            local_addr,
            remote_addr,
        )
        .with_rtc(self.rtc_config()?)
        .with_keepalive(Some(self.keepalive_secs))
        .with_probe_timeout(Duration::from_secs(self.probe_timeout_secs));
        config.validate()?;
        Ok(config)
    }

    fn rtc_config(&self) -> Result<WebRtcConfig, ConfigError> {
        let mut builder = WebRtcConfig::builder()
            .negotiation_timeout(Duration::from_secs(self.negotiation_timeout_secs));
        if !self.localhost_only {
            let servers = if self.ice_servers.is_empty() {
                vec![DEFAULT_STUN_SERVER.to_string()]
            } else {
                self.ice_servers.clone()
            };
            for server in servers {
                builder = builder.add_ice_server(vec![server]);
            }
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "KLuBc6tM/NRV1071bfPiNUxZmMhGBCXfxoDg+A+J7ns=";
    const REMOTE_KEY: &str = "6M9O7PRhKMEOiboBp9cX6rNrLBevtHX7H0O2FMXUkFI=";

    fn parse(extra: &[&str]) -> Cli {
        let mut args = vec![
            "riptide",
            "--key",
            KEY,
            "--remote-key",
            REMOTE_KEY,
            "--signal-endpoint",
            "ws://127.0.0.1:80/signal",
            "--ip",
            "100.0.2.1",
            "--remote-ip",
            "100.0.2.2",
        ];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn builds_a_responder_by_default() {
        let config = parse(&[]).tunnel_config().unwrap();
        assert_eq!(config.role, TunnelRole::Responder);
        assert_eq!(config.keepalive, Some(DEFAULT_KEEPALIVE_SECS));
        assert_eq!(config.remote.to_base64(), REMOTE_KEY);
        assert_eq!(config.rtc.ice_servers.len(), 1);
        assert_eq!(config.rtc.negotiation_timeout, Duration::from_secs(30));
    }

    #[test]
    fn client_flag_and_tuning() {
        let cli = parse(&[
            "--client",
            "--keepalive-secs",
            "0",
            "--negotiation-timeout-secs",
            "5",
            "--ice-server",
            "stun:a.example:3478",
            "--ice-server",
            "stun:b.example:3478",
            "--retry",
            "--log-level",
            "debug",
        ]);
        assert!(cli.retry);
        assert_eq!(cli.log_config().level, LogLevel::Debug);
        let config = cli.tunnel_config().unwrap();
        assert_eq!(config.role, TunnelRole::Initiator);
        assert_eq!(config.keepalive, None);
        assert_eq!(config.rtc.negotiation_timeout, Duration::from_secs(5));
        assert_eq!(config.rtc.ice_servers.len(), 2);
    }

    #[test]
    fn localhost_only_drops_stun() {
        let config = parse(&["--localhost-only"]).tunnel_config().unwrap();
        assert!(config.rtc.ice_servers.is_empty());
    }

    #[test]
    fn malformed_inputs_are_config_errors() {
        let mut cli = parse(&[]);
        cli.ip = "100.0.2".into();
        assert!(matches!(
            cli.tunnel_config(),
            Err(ConfigError::InvalidAddress { field: "ip", .. })
        ));

        let mut cli = parse(&[]);
        cli.remote_key = "not-a-key".into();
        assert!(matches!(
            cli.tunnel_config(),
            Err(ConfigError::InvalidKey {
                field: "remote-key",
                ..
            })
        ));

        let mut cli = parse(&[]);
        cli.negotiation_timeout_secs = 0;
        assert!(matches!(
            cli.tunnel_config(),
            Err(ConfigError::Zero { .. })
        ));
    }
}
