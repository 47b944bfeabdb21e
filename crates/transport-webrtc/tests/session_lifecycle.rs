use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use transport_signaling::{
    IDENTITY_LEN, LocalRelay, PeerIdentity, SignalKind, SignalingMessage, SignalingSession,
};
use transport_webrtc::{
    Bind, ChannelState, DataChannelBind, Endpoint, FailureReason, MemoryNetwork,
    NegotiationError, NegotiationRole, PeerEvent, PeerFactory, PeerHandle, RtcPeer, SendError,
    SignalRouter, TransportError, WebRtcConfig, WebRtcPeerFactory,
};
use transport_webrtc::config::ConfigError;

const STEP: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn identity(byte: u8) -> PeerIdentity {
    PeerIdentity::from_bytes([byte; IDENTITY_LEN])
}

fn fast_config() -> WebRtcConfig {
    WebRtcConfig::builder()
        .negotiation_timeout(Duration::from_secs(3))
        .keepalive_interval(Duration::from_millis(50))
        .liveness_timeout(Duration::from_millis(300))
        .signal_retry_interval(Duration::from_millis(100))
        .build()
        .expect("valid config")
}

struct TestPeer {
    bind: Arc<DataChannelBind>,
    router: Arc<SignalRouter>,
    signaling: Arc<SignalingSession>,
}

async fn test_peer(
    relay: &LocalRelay,
    network: &MemoryNetwork,
    local: u8,
    remote: u8,
    role: NegotiationRole,
    config: WebRtcConfig,
) -> TestPeer {
    let signaling = relay.connect(identity(local)).await.expect("join relay");
    let router = SignalRouter::new(Arc::clone(&signaling));
    let bind = Arc::new(DataChannelBind::new(
        Arc::clone(&router),
        Arc::new(network.factory()),
        identity(remote),
        role,
        config,
    ));
    TestPeer {
        bind,
        router,
        signaling,
    }
}

async fn open_pair(
    relay: &LocalRelay,
    network: &MemoryNetwork,
    config: WebRtcConfig,
) -> (TestPeer, TestPeer) {
    let initiator = test_peer(relay, network, 1, 2, NegotiationRole::Initiator, config.clone()).await;
    let responder = test_peer(relay, network, 2, 1, NegotiationRole::Responder, config).await;
    responder.bind.open().await.expect("responder open");
    initiator.bind.open().await.expect("initiator open");
    timeout(STEP, initiator.bind.wait_open())
        .await
        .expect("initiator open in time")
        .expect("initiator reaches open");
    timeout(STEP, responder.bind.wait_open())
        .await
        .expect("responder open in time")
        .expect("responder reaches open");
    (initiator, responder)
}

async fn wait_for_state(bind: &DataChannelBind, wanted: fn(&ChannelState) -> bool) -> ChannelState {
    let mut states = bind.state_changes().expect("bind opened");
    let reached = timeout(STEP, states.wait_for(|state| wanted(state)))
        .await
        .expect("state reached in time")
        .map(|state| state.clone());
    reached.unwrap_or(ChannelState::Closed)
}

#[test_timeout::tokio_timeout_test(30)]
async fn initiator_packet_reaches_responder() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let (p1, p2) = open_pair(&relay, &network, fast_config()).await;

    let to_p2 = p1.bind.parse_endpoint("webrtc://datachannel").unwrap();
    p1.bind
        .send(&to_p2, Bytes::from_static(b"ping"))
        .await
        .expect("send ping");
    let (from, packet) = timeout(STEP, p2.bind.recv())
        .await
        .expect("packet in time")
        .expect("transport alive");
    assert_eq!(from, Endpoint::new(identity(1)));
    assert_eq!(packet, Bytes::from_static(b"ping"));

    let to_p1 = p2.bind.parse_endpoint("webrtc://datachannel").unwrap();
    p2.bind
        .send(&to_p1, Bytes::from_static(b"pong"))
        .await
        .expect("send pong");
    let (from, packet) = timeout(STEP, p1.bind.recv()).await.unwrap().unwrap();
    assert_eq!(from.remote(), identity(2));
    assert_eq!(packet, Bytes::from_static(b"pong"));

    p1.bind.close().await;
    p2.bind.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn initiator_without_responder_times_out() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let config = WebRtcConfig::builder()
        .negotiation_timeout(Duration::from_millis(400))
        .build()
        .unwrap();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, config).await;

    let started = Instant::now();
    p1.bind.open().await.unwrap();
    let before = wait_for_state(&p1.bind, |state| {
        matches!(state, ChannelState::Offering | ChannelState::Negotiating) || state.is_terminal()
    })
    .await;
    assert_eq!(before, ChannelState::Offering);

    let ended = timeout(STEP, p1.bind.wait_terminated()).await.unwrap();
    assert_eq!(
        ended,
        ChannelState::Failed(FailureReason::NegotiationTimeout(Duration::from_millis(400)))
    );
    assert!(started.elapsed() >= Duration::from_millis(400));

    let endpoint = Endpoint::new(identity(2));
    assert!(matches!(
        p1.bind.send(&endpoint, Bytes::from_static(b"late")).await,
        Err(SendError::Failed(FailureReason::NegotiationTimeout(_)))
    ));
    assert!(p1.bind.recv().await.is_none());
}

#[test_timeout::tokio_timeout_test(30)]
async fn responder_waits_for_offer_until_timeout() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let config = WebRtcConfig::builder()
        .negotiation_timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let p2 = test_peer(&relay, &network, 2, 1, NegotiationRole::Responder, config).await;

    p2.bind.open().await.unwrap();
    let waiting = wait_for_state(&p2.bind, |state| *state != ChannelState::Idle).await;
    assert_eq!(waiting, ChannelState::AwaitingOffer);

    let ended = timeout(STEP, p2.bind.wait_terminated()).await.unwrap();
    assert!(matches!(
        ended,
        ChannelState::Failed(FailureReason::NegotiationTimeout(_))
    ));
}

#[test_timeout::tokio_timeout_test(30)]
async fn candidates_before_offer_do_not_disturb_responder() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p2 = test_peer(&relay, &network, 2, 1, NegotiationRole::Responder, fast_config()).await;
    let stray = relay.connect(identity(1)).await.unwrap();

    stray
        .send(SignalingMessage::new(
            identity(1),
            identity(2),
            SignalKind::Candidate,
            Bytes::from_static(br#"{"handshake_id":"h-1","body":"eA=="}"#),
        ))
        .unwrap();
    stray
        .send(SignalingMessage::new(
            identity(1),
            identity(2),
            SignalKind::Candidate,
            Bytes::from_static(b"not even json"),
        ))
        .unwrap();
    for _ in 0..100 {
        if p2.router.buffered(&identity(1)) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(p2.router.buffered(&identity(1)), 2);

    p2.bind.open().await.unwrap();
    assert_eq!(p2.router.buffered(&identity(1)), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p2.bind.state(), ChannelState::AwaitingOffer);
    p2.bind.close().await;
    assert_eq!(p2.bind.state(), ChannelState::Closed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn early_offer_is_replayed_when_responder_opens_late() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, fast_config()).await;
    let p2 = test_peer(&relay, &network, 2, 1, NegotiationRole::Responder, fast_config()).await;

    p1.bind.open().await.unwrap();
    for _ in 0..200 {
        if p2.router.buffered(&identity(1)) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(p2.router.buffered(&identity(1)) >= 2, "offer and candidate buffered");

    p2.bind.open().await.unwrap();
    timeout(STEP, p2.bind.wait_open()).await.unwrap().unwrap();
    timeout(STEP, p1.bind.wait_open()).await.unwrap().unwrap();
}

#[test_timeout::tokio_timeout_test(30)]
async fn severed_channel_fails_and_unblocks_reader() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let (p1, p2) = open_pair(&relay, &network, fast_config()).await;

    let reader_bind = Arc::clone(&p2.bind);
    let reader = tokio::spawn(async move { reader_bind.recv().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let severed_at = Instant::now();
    network.links()[0].sever();

    let received = timeout(STEP, reader).await.expect("reader unblocked").unwrap();
    assert!(received.is_none());
    assert!(severed_at.elapsed() < Duration::from_millis(300));
    assert!(matches!(
        p2.bind.state(),
        ChannelState::Failed(FailureReason::ChannelLost(_))
    ));
    assert!(matches!(
        timeout(STEP, p1.bind.wait_terminated()).await.unwrap(),
        ChannelState::Failed(FailureReason::ChannelLost(_))
    ));
}

#[test_timeout::tokio_timeout_test(30)]
async fn silent_channel_is_caught_by_liveness() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let (p1, _p2) = open_pair(&relay, &network, fast_config()).await;

    let silenced_at = Instant::now();
    network.links()[0].silence();

    let ended = timeout(STEP, p1.bind.wait_terminated()).await.unwrap();
    assert_eq!(
        ended,
        ChannelState::Failed(FailureReason::LivenessLost(Duration::from_millis(300)))
    );
    // liveness timeout plus at most one keepalive tick
    assert!(silenced_at.elapsed() < Duration::from_millis(300 + 50 + 200));
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn close_is_idempotent_and_releases_once() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p2 = test_peer(&relay, &network, 2, 1, NegotiationRole::Responder, fast_config()).await;
    p2.bind.open().await.unwrap();

    let first = Arc::clone(&p2.bind);
    let second = Arc::clone(&p2.bind);
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.close().await }),
        tokio::spawn(async move { second.close().await }),
    );
    a.unwrap();
    b.unwrap();
    p2.bind.close().await;

    assert_eq!(p2.bind.state(), ChannelState::Closed);
    assert_eq!(network.release_count(), 1);
    assert_eq!(p2.bind.open().await, Err(TransportError::Closed));
    assert_eq!(
        p2.bind
            .send(&Endpoint::new(identity(1)), Bytes::from_static(b"x"))
            .await,
        Err(SendError::Closed)
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn sends_before_open_are_queued_then_flushed() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let config = WebRtcConfig::builder()
        .max_pending_sends(3)
        .negotiation_timeout(Duration::from_secs(3))
        .build()
        .unwrap();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, config.clone()).await;
    let p2 = test_peer(&relay, &network, 2, 1, NegotiationRole::Responder, config).await;

    let to_p2 = Endpoint::new(identity(2));
    assert_eq!(
        p1.bind.send(&to_p2, Bytes::from_static(b"early")).await,
        Err(SendError::NotOpen)
    );

    p1.bind.open().await.unwrap();
    for index in 0..3u8 {
        p1.bind.send(&to_p2, Bytes::from(vec![index])).await.unwrap();
    }
    assert_eq!(
        p1.bind.send(&to_p2, Bytes::from_static(b"overflow")).await,
        Err(SendError::QueueFull(3))
    );

    p2.bind.open().await.unwrap();
    for index in 0..3u8 {
        let (_, packet) = timeout(STEP, p2.bind.recv()).await.unwrap().unwrap();
        assert_eq!(packet.as_ref(), &[index]);
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn one_live_session_per_remote() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, fast_config()).await;

    p1.bind.open().await.unwrap();
    let first = p1.bind.session().unwrap();
    p1.bind.open().await.unwrap();
    assert!(Arc::ptr_eq(&first, &p1.bind.session().unwrap()));

    let rival = DataChannelBind::new(
        Arc::clone(&p1.router),
        Arc::new(network.factory()),
        identity(2),
        NegotiationRole::Initiator,
        fast_config(),
    );
    assert_eq!(
        rival.open().await,
        Err(TransportError::SessionActive(identity(2)))
    );
    p1.bind.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn relay_loss_during_negotiation_fails_session() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, fast_config()).await;
    p1.bind.open().await.unwrap();
    wait_for_state(&p1.bind, |state| *state == ChannelState::Offering).await;

    assert!(relay.disconnect(&identity(1)));
    let ended = timeout(STEP, p1.bind.wait_terminated()).await.unwrap();
    assert!(matches!(
        ended,
        ChannelState::Failed(FailureReason::Signaling(_))
    ));
    assert!(!p1.signaling.is_open());
}

#[test_timeout::tokio_timeout_test(30)]
async fn failed_session_can_be_reopened() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let config = WebRtcConfig::builder()
        .negotiation_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, config).await;

    p1.bind.open().await.unwrap();
    let ended = timeout(STEP, p1.bind.wait_terminated()).await.unwrap();
    assert!(ended.is_terminal());
    let failed = p1.bind.session().unwrap();

    p1.bind.open().await.expect("fresh session after failure");
    let fresh = p1.bind.session().unwrap();
    assert!(!Arc::ptr_eq(&failed, &fresh));
    assert!(!fresh.state().is_terminal());
}

#[test_timeout::tokio_timeout_test(30)]
async fn endpoints_resolve_to_the_bound_remote() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, fast_config()).await;

    let bound = Endpoint::new(identity(2));
    assert_eq!(p1.bind.parse_endpoint("webrtc://datachannel"), Ok(bound));
    assert_eq!(p1.bind.parse_endpoint(&bound.to_string()), Ok(bound));
    let stranger = Endpoint::new(identity(7)).to_string();
    for descriptor in ["udp://127.0.0.1:51820", "webrtc://", stranger.as_str()] {
        assert!(matches!(
            p1.bind.parse_endpoint(descriptor),
            Err(TransportError::InvalidEndpoint { .. })
        ));
    }

    p1.bind.open().await.unwrap();
    assert!(matches!(
        p1.bind
            .send(&Endpoint::new(identity(7)), Bytes::from_static(b"x"))
            .await,
        Err(SendError::WrongEndpoint(_))
    ));
}

#[test_timeout::tokio_timeout_test(30)]
async fn responder_joining_late_still_receives_the_offer() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, fast_config()).await;
    p1.bind.open().await.unwrap();
    wait_for_state(&p1.bind, |state| *state == ChannelState::Offering).await;
    // The first offer went to an empty relay slot and was dropped.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(p1.bind.state(), ChannelState::Offering);

    let p2 = test_peer(&relay, &network, 2, 1, NegotiationRole::Responder, fast_config()).await;
    p2.bind.open().await.unwrap();
    timeout(STEP, p2.bind.wait_open()).await.unwrap().unwrap();
    timeout(STEP, p1.bind.wait_open()).await.unwrap().unwrap();

    p1.bind
        .send(&Endpoint::new(identity(2)), Bytes::from_static(b"ping"))
        .await
        .unwrap();
    let (from, packet) = timeout(STEP, p2.bind.recv()).await.unwrap().unwrap();
    assert_eq!(from.remote(), identity(1));
    assert_eq!(packet, Bytes::from_static(b"ping"));
}

#[test_timeout::tokio_timeout_test(30)]
async fn repeated_offer_is_answered_again() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let p2 = test_peer(&relay, &network, 2, 1, NegotiationRole::Responder, fast_config()).await;
    let initiator = relay.connect(identity(1)).await.unwrap();
    let mut answers = initiator.subscribe(identity(1));
    p2.bind.open().await.unwrap();

    // A real offer, so the responder can produce an answer for it.
    let offerer = network.factory().create_peer(NegotiationRole::Initiator).await.unwrap();
    let offer = offerer.peer.create_offer().await.unwrap();
    let encoded = |handshake_id: &str| {
        Bytes::from(format!(
            r#"{{"handshake_id":"{handshake_id}","body":"{}"}}"#,
            STANDARD.encode(&offer)
        ))
    };
    for handshake_id in ["h-1", "h-1", "h-2"] {
        initiator
            .send(SignalingMessage::new(
                identity(1),
                identity(2),
                SignalKind::Offer,
                encoded(handshake_id),
            ))
            .unwrap();
    }

    let mut answered = Vec::new();
    let collect = async {
        while let Some(message) = answers.next_message().await {
            if message.kind == SignalKind::Answer {
                answered.push(message.payload);
            }
        }
    };
    let _ = timeout(Duration::from_millis(500), collect).await;
    assert_eq!(answered.len(), 2, "one answer per copy of the current offer");
    assert_eq!(answered[0], answered[1]);
    assert_eq!(p2.bind.state(), ChannelState::Negotiating);
    p2.bind.close().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn invalid_literal_config_is_refused_at_open() {
    init_tracing();
    let relay = LocalRelay::new();
    let network = MemoryNetwork::new();
    let config = WebRtcConfig {
        keepalive_interval: Duration::ZERO,
        ..fast_config()
    };
    let p1 = test_peer(&relay, &network, 1, 2, NegotiationRole::Initiator, config).await;

    assert_eq!(
        p1.bind.open().await,
        Err(TransportError::InvalidConfig(ConfigError::Zero {
            field: "keepalive interval"
        }))
    );
    assert_eq!(p1.bind.state(), ChannelState::Idle);
    assert_eq!(network.release_count(), 0);
    // The refused attempt does not hold the remote's signal slot.
    let retry = DataChannelBind::new(
        Arc::clone(&p1.router),
        Arc::new(network.factory()),
        identity(2),
        NegotiationRole::Initiator,
        fast_config(),
    );
    retry.open().await.unwrap();
    retry.close().await;
}

/// Peer driven by the test through its event sender. With `panics` set,
/// the offer step panics to stand in for a driver bug.
struct ScriptedPeer {
    panics: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RtcPeer for ScriptedPeer {
    async fn create_offer(&self) -> Result<Bytes, NegotiationError> {
        if self.panics {
            panic!("offer machinery exploded");
        }
        Ok(Bytes::from_static(b"scripted-offer"))
    }

    async fn accept_offer(&self, _offer: Bytes) -> Result<Bytes, NegotiationError> {
        Ok(Bytes::from_static(b"scripted-answer"))
    }

    async fn apply_answer(&self, _answer: Bytes) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: Bytes) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn send(&self, _message: Bytes) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedFactory {
    panics: bool,
    closed: Arc<AtomicBool>,
    events: parking_lot::Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl ScriptedFactory {
    fn emit(&self, event: PeerEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            events.send(event).expect("session listening");
        }
    }
}

#[async_trait]
impl PeerFactory for ScriptedFactory {
    async fn create_peer(&self, _role: NegotiationRole) -> Result<PeerHandle, NegotiationError> {
        let (events, receiver) = mpsc::unbounded_channel();
        *self.events.lock() = Some(events);
        Ok(PeerHandle {
            peer: Arc::new(ScriptedPeer {
                panics: self.panics,
                closed: Arc::clone(&self.closed),
            }),
            events: receiver,
        })
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn panicking_driver_leaves_session_failed() {
    init_tracing();
    let relay = LocalRelay::new();
    let signaling = relay.connect(identity(1)).await.unwrap();
    let router = SignalRouter::new(signaling);
    let factory = Arc::new(ScriptedFactory {
        panics: true,
        ..ScriptedFactory::default()
    });
    let bind = DataChannelBind::new(
        router,
        factory.clone(),
        identity(2),
        NegotiationRole::Initiator,
        fast_config(),
    );

    bind.open().await.unwrap();
    let opened = timeout(STEP, bind.wait_open()).await.unwrap();
    assert!(
        matches!(opened, Err(ChannelState::Failed(FailureReason::Driver(_)))),
        "{opened:?}"
    );
    assert!(timeout(STEP, bind.recv()).await.unwrap().is_none());
    assert!(matches!(
        bind.send(&Endpoint::new(identity(2)), Bytes::from_static(b"x"))
            .await,
        Err(SendError::Failed(FailureReason::Driver(_)))
    ));
    assert!(factory.closed.load(Ordering::SeqCst));
    bind.close().await;
}

#[test_timeout::tokio_timeout_test(60, multi_thread)]
async fn real_peer_connections_carry_packets_on_localhost() {
    init_tracing();
    let relay = LocalRelay::new();
    let config = WebRtcConfig {
        negotiation_timeout: Duration::from_secs(15),
        keepalive_interval: Duration::from_millis(200),
        liveness_timeout: Duration::from_secs(5),
        signal_retry_interval: Duration::from_millis(500),
        ..WebRtcConfig::localhost()
    };
    let factory: Arc<dyn PeerFactory> = Arc::new(WebRtcPeerFactory::new(config.clone()));
    let bind = |signaling: Arc<SignalingSession>, remote: u8, role: NegotiationRole| {
        DataChannelBind::new(
            SignalRouter::new(signaling),
            Arc::clone(&factory),
            identity(remote),
            role,
            config.clone(),
        )
    };
    let p1 = bind(
        relay.connect(identity(1)).await.unwrap(),
        2,
        NegotiationRole::Initiator,
    );
    let p2 = bind(
        relay.connect(identity(2)).await.unwrap(),
        1,
        NegotiationRole::Responder,
    );

    p2.open().await.unwrap();
    p1.open().await.unwrap();
    let long = Duration::from_secs(20);
    timeout(long, p1.wait_open()).await.unwrap().unwrap();
    timeout(long, p2.wait_open()).await.unwrap().unwrap();

    p1.send(&Endpoint::new(identity(2)), Bytes::from_static(b"ping"))
        .await
        .unwrap();
    let (from, packet) = timeout(long, p2.recv()).await.unwrap().unwrap();
    assert_eq!(from, Endpoint::new(identity(1)));
    assert_eq!(packet, Bytes::from_static(b"ping"));

    p1.close().await;
    p2.close().await;
    assert_eq!(p1.state(), ChannelState::Closed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn late_candidate_without_relay_keeps_channel_open() {
    init_tracing();
    let relay = LocalRelay::new();
    let signaling = relay.connect(identity(1)).await.unwrap();
    let factory = Arc::new(ScriptedFactory::default());
    let config = WebRtcConfig::builder()
        .negotiation_timeout(Duration::from_secs(3))
        .keepalive_interval(Duration::from_millis(500))
        .liveness_timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    let bind = DataChannelBind::new(
        SignalRouter::new(Arc::clone(&signaling)),
        factory.clone(),
        identity(2),
        NegotiationRole::Initiator,
        config,
    );
    bind.open().await.unwrap();
    wait_for_state(&bind, |state| *state == ChannelState::Offering).await;
    factory.emit(PeerEvent::ChannelOpen);
    timeout(STEP, bind.wait_open()).await.unwrap().unwrap();

    assert!(relay.disconnect(&identity(1)));
    for _ in 0..100 {
        if !signaling.is_open() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!signaling.is_open());

    factory.emit(PeerEvent::LocalCandidate(Bytes::from_static(b"late")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bind.state(), ChannelState::Open);
    bind.send(&Endpoint::new(identity(2)), Bytes::from_static(b"still here"))
        .await
        .unwrap();
    bind.close().await;
    assert!(factory.closed.load(Ordering::SeqCst));
}
