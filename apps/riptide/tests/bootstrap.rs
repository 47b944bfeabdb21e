use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use riptide_core::engine::{
    EngineError, EngineSettings, InterfacePort, TunnelEngine, WireGuardEngine,
};
use riptide_core::{
    BootstrapError, ConfigError, KeyPair, TunnelConfig, TunnelRole, bootstrap, bootstrap_with,
};
use transport_signaling::LocalRelay;
use transport_webrtc::{Bind, ChannelState, MemoryNetwork, PeerFactory, WebRtcConfig};

const INITIATOR_IP: Ipv4Addr = Ipv4Addr::new(100, 0, 2, 1);
const RESPONDER_IP: Ipv4Addr = Ipv4Addr::new(100, 0, 2, 2);

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn rtc(negotiation_timeout: Duration) -> WebRtcConfig {
    WebRtcConfig::builder()
        .negotiation_timeout(negotiation_timeout)
        .keepalive_interval(Duration::from_millis(100))
        .liveness_timeout(Duration::from_secs(2))
        .build()
        .expect("valid rtc config")
}

fn tunnel_pair(negotiation_timeout: Duration) -> (TunnelConfig, TunnelConfig) {
    let initiator_keys = KeyPair::generate();
    let responder_keys = KeyPair::generate();
    let initiator = TunnelConfig::new(
        initiator_keys.clone(),
        responder_keys.public(),
        TunnelRole::Initiator,
        "local://relay",
        INITIATOR_IP,
        RESPONDER_IP,
    )
    .with_rtc(rtc(negotiation_timeout))
    .with_probe_timeout(Duration::from_secs(10));
    let responder = TunnelConfig::new(
        responder_keys,
        initiator_keys.public(),
        TunnelRole::Responder,
        "local://relay",
        RESPONDER_IP,
        INITIATOR_IP,
    )
    .with_rtc(rtc(negotiation_timeout));
    (initiator, responder)
}

/// Engine that records its settings and only opens the transport.
#[derive(Default)]
struct RecordingEngine {
    settings: Mutex<Vec<String>>,
    bind: Mutex<Option<Arc<dyn Bind>>>,
}

impl RecordingEngine {
    fn applied(&self) -> EngineSettings {
        let settings = self.settings.lock();
        EngineSettings::from_uapi(settings.last().expect("settings applied")).unwrap()
    }
}

#[async_trait]
impl TunnelEngine for RecordingEngine {
    fn ipc_set(&self, settings: &str) -> Result<(), EngineError> {
        self.settings.lock().push(settings.to_string());
        Ok(())
    }

    async fn up(&self, _port: InterfacePort, bind: Arc<dyn Bind>) -> Result<(), EngineError> {
        bind.open().await?;
        *self.bind.lock() = Some(bind);
        Ok(())
    }

    async fn down(&self) {
        let bind = self.bind.lock().take();
        if let Some(bind) = bind {
            bind.close().await;
        }
    }
}

#[test_timeout::tokio_timeout_test(40, multi_thread)]
async fn initiator_verifies_tunnel_through_responder() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let (initiator_config, responder_config) = tunnel_pair(Duration::from_secs(10));
    let factory: Arc<dyn PeerFactory> = Arc::new(network.factory());

    let responder_signaling = relay
        .connect(responder_config.key_pair.public())
        .await
        .unwrap();
    let responder = bootstrap_with(
        responder_config,
        responder_signaling,
        Arc::clone(&factory),
        Arc::new(WireGuardEngine::new()),
    )
    .await
    .expect("responder comes up");
    assert_eq!(responder.role(), TunnelRole::Responder);
    assert!(responder.probe_report().is_none());

    let initiator_signaling = relay
        .connect(initiator_config.key_pair.public())
        .await
        .unwrap();
    let initiator = bootstrap_with(
        initiator_config,
        initiator_signaling,
        factory,
        Arc::new(WireGuardEngine::new()),
    )
    .await
    .expect("initiator comes up and verifies");

    let report = initiator.probe_report().expect("initiator probes");
    assert_eq!(report.remote, RESPONDER_IP);
    assert!(report.rtt < Duration::from_secs(10));
    assert_eq!(initiator.channel_state(), ChannelState::Open);
    assert_eq!(responder.channel_state(), ChannelState::Open);

    initiator.shutdown().await;
    let ended = tokio::time::timeout(Duration::from_secs(5), responder.wait_terminated())
        .await
        .expect("responder notices the initiator leaving");
    assert!(matches!(ended, Err(BootstrapError::ChannelDied(_))));
    responder.shutdown().await;
    assert_eq!(network.release_count(), 2);
}

#[test_timeout::tokio_timeout_test(20, multi_thread)]
async fn responder_policy_allows_only_the_initiator() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let (_, responder_config) = tunnel_pair(Duration::from_secs(10));
    let remote = responder_config.remote;
    let signaling = relay
        .connect(responder_config.key_pair.public())
        .await
        .unwrap();
    let engine = Arc::new(RecordingEngine::default());

    let responder = bootstrap_with(
        responder_config,
        signaling,
        Arc::new(network.factory()),
        engine.clone(),
    )
    .await
    .unwrap();

    let applied = engine.applied();
    assert_eq!(applied.public_key, remote);
    assert_eq!(applied.endpoint.as_deref(), Some("webrtc://datachannel"));
    assert_eq!(applied.persistent_keepalive, Some(100));
    assert_eq!(applied.allowed_ips.len(), 1);
    assert_eq!(applied.allowed_ips[0].to_string(), "100.0.2.1/32");
    assert!(applied.allows(INITIATOR_IP.into()));
    assert!(!applied.allows(Ipv4Addr::new(8, 8, 8, 8).into()));
    assert_eq!(responder.channel_state(), ChannelState::AwaitingOffer);
    responder.shutdown().await;
}

#[test_timeout::tokio_timeout_test(20, multi_thread)]
async fn unanswered_initiator_reports_peer_did_not_answer() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let (initiator_config, _) = tunnel_pair(Duration::from_millis(300));
    let remote = initiator_config.remote;
    let local = initiator_config.key_pair.public();
    let signaling = relay.connect(local).await.unwrap();
    let engine = Arc::new(RecordingEngine::default());

    let result = bootstrap_with(
        initiator_config,
        signaling,
        Arc::new(network.factory()),
        engine.clone(),
    )
    .await;

    match result {
        Err(err @ BootstrapError::PeerDidNotAnswer { .. }) => {
            assert!(err.is_retryable());
            let BootstrapError::PeerDidNotAnswer { remote: peer, waited } = err else {
                unreachable!()
            };
            assert_eq!(peer, remote);
            assert_eq!(waited, Duration::from_millis(300));
        }
        Err(other) => panic!("expected PeerDidNotAnswer, got {other}"),
        Ok(_) => panic!("bootstrap succeeded without a responder"),
    }
    assert_eq!(engine.applied().allowed_ips[0].to_string(), "0.0.0.0/0");
    // The failed attempt leaves the relay so a retry can join again.
    tokio::time::timeout(Duration::from_secs(2), async {
        while relay.is_connected(&local) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("left the relay");
}

#[test_timeout::tokio_timeout_test(20)]
async fn unreachable_relay_is_distinguished() {
    init_tracing();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (mut config, _) = tunnel_pair(Duration::from_secs(1));
    config.signal_endpoint = format!("ws://127.0.0.1:{port}/signal");

    let err = bootstrap(config).await.err().expect("no relay listening");
    assert!(matches!(err, BootstrapError::RelayUnreachable(_)), "{err}");
    assert!(err.is_retryable());
}

#[test_timeout::tokio_timeout_test(20)]
async fn configuration_errors_are_fatal() {
    init_tracing();
    let (mut config, _) = tunnel_pair(Duration::from_secs(1));
    config.signal_endpoint = "ftp://relay.example/signal".into();
    let err = bootstrap(config).await.err().expect("bad endpoint");
    assert!(matches!(
        err,
        BootstrapError::Config(ConfigError::InvalidEndpoint(_))
    ));
    assert!(!err.is_retryable());

    let (mut config, _) = tunnel_pair(Duration::from_secs(1));
    config.remote = config.key_pair.public();
    let err = bootstrap(config).await.err().expect("self peer");
    assert!(matches!(err, BootstrapError::Config(ConfigError::SelfPeer(_))));
    assert!(!err.is_retryable());

    let (mut config, _) = tunnel_pair(Duration::from_secs(1));
    config.signaling.heartbeat_interval = Duration::ZERO;
    let err = bootstrap(config).await.err().expect("zero heartbeat");
    assert!(matches!(
        err,
        BootstrapError::Config(ConfigError::InvalidSignaling(_))
    ));

    let (mut config, _) = tunnel_pair(Duration::from_secs(1));
    config.rtc.keepalive_interval = Duration::ZERO;
    let err = bootstrap(config).await.err().expect("zero keepalive");
    assert!(matches!(err, BootstrapError::Config(ConfigError::WebRtc(_))));
    assert!(!err.is_retryable());
}
