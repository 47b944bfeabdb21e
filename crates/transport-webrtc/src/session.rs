use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use transport_signaling::{PeerIdentity, SignalKind, SignalingMessage, SignalingSession};
use uuid::Uuid;

use crate::frame::Frame;
use crate::router::SignalInbox;
use crate::{
    ChannelState, FailureReason, NegotiationError, NegotiationRole, PeerEvent, PeerFactory,
    RtcPeer, SendError, TransportError, WebRtcConfig,
};

/// Remote candidates held until the remote description is applied.
const MAX_HELD_CANDIDATES: usize = 64;

/// Signaling payload: the opaque description or candidate plus the id of the
/// negotiation it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NegotiationPayload {
    handshake_id: String,
    body: String,
}

impl NegotiationPayload {
    fn encode(handshake_id: &str, body: &[u8]) -> Bytes {
        let payload = NegotiationPayload {
            handshake_id: handshake_id.to_string(),
            body: STANDARD.encode(body),
        };
        serde_json::to_vec(&payload).map(Bytes::from).unwrap_or_default()
    }

    fn decode(raw: &[u8]) -> Option<(String, Bytes)> {
        let payload: NegotiationPayload = serde_json::from_slice(raw).ok()?;
        let body = STANDARD.decode(payload.body.as_bytes()).ok()?;
        Some((payload.handshake_id, Bytes::from(body)))
    }
}

struct Shared {
    local: PeerIdentity,
    remote: PeerIdentity,
    role: NegotiationRole,
    state: watch::Sender<ChannelState>,
    pending: Mutex<VecDeque<Bytes>>,
    max_pending: usize,
    peer: Arc<dyn RtcPeer>,
    shutdown: Notify,
}

impl Shared {
    fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    /// Moves to `next` unless the session is already terminal. The pending
    /// queue lock is held so a concurrent `send` never queues behind a
    /// transition it did not see.
    fn transition(&self, next: ChannelState) -> bool {
        let mut pending = self.pending.lock();
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next.clone();
            true
        });
        if changed {
            if next.is_terminal() {
                pending.clear();
            }
            self.log_transition(&next);
        }
        changed
    }

    /// Enters `Open` and hands back whatever was queued while negotiating.
    fn open_and_drain(&self) -> Option<Vec<Bytes>> {
        let mut pending = self.pending.lock();
        let opened = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = ChannelState::Open;
            true
        });
        if !opened {
            return None;
        }
        self.log_transition(&ChannelState::Open);
        Some(pending.drain(..).collect())
    }

    fn log_transition(&self, next: &ChannelState) {
        match next {
            ChannelState::Open => tracing::info!(
                target = "webrtc",
                remote = %self.remote.short(),
                role = ?self.role,
                "data channel open"
            ),
            ChannelState::Failed(reason) => tracing::warn!(
                target = "webrtc",
                remote = %self.remote.short(),
                "session failed: {reason}"
            ),
            other => tracing::debug!(
                target = "webrtc",
                remote = %self.remote.short(),
                state = other.label(),
                "session state"
            ),
        }
    }
}

/// One negotiated data channel to one remote peer.
///
/// A driver task owns negotiation, liveness and teardown. The handle only
/// observes state, queues or writes packets and reads delivered packets.
pub struct ChannelSession {
    shared: Arc<Shared>,
    inbound: AsyncMutex<mpsc::Receiver<Bytes>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSession {
    /// Creates the peer connection and starts negotiating. The negotiation
    /// deadline starts now.
    pub async fn open(
        local: PeerIdentity,
        remote: PeerIdentity,
        role: NegotiationRole,
        config: &WebRtcConfig,
        factory: &dyn PeerFactory,
        signaling: Arc<SignalingSession>,
        inbox: SignalInbox,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let deadline = Instant::now() + config.negotiation_timeout;
        let handle = factory
            .create_peer(role)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;

        let shared = Arc::new(Shared {
            local,
            remote,
            role,
            state: watch::Sender::new(ChannelState::Idle),
            pending: Mutex::new(VecDeque::new()),
            max_pending: config.max_pending_sends,
            peer: handle.peer,
            shutdown: Notify::new(),
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

        let driver = Driver {
            shared: Arc::clone(&shared),
            signaling,
            inbox: Some(inbox),
            events: handle.events,
            inbound: inbound_tx,
            deadline,
            negotiation_timeout: config.negotiation_timeout,
            keepalive_interval: config.keepalive_interval,
            liveness_timeout: config.liveness_timeout,
            signal_retry_interval: config.signal_retry_interval,
            handshake_id: None,
            offer: None,
            answer: None,
            remote_described: false,
            held_candidates: Vec::new(),
            held_local: Vec::new(),
            sent_local: Vec::new(),
            seen_remote: HashSet::new(),
            early_messages: Vec::new(),
        };
        let driver = tokio::spawn(driver.run());
        // A driver that dies abnormally still leaves the session terminal.
        let supervised = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            if let Err(err) = driver.await {
                supervised.transition(ChannelState::Failed(FailureReason::Driver(err.to_string())));
                supervised.peer.close().await;
            }
        });

        Ok(Self {
            shared,
            inbound: AsyncMutex::new(inbound_rx),
            driver: Mutex::new(Some(task)),
        })
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.shared.local
    }

    pub fn remote_identity(&self) -> PeerIdentity {
        self.shared.remote
    }

    pub fn role(&self) -> NegotiationRole {
        self.shared.role
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the channel is open, or with the terminal state that
    /// ended it first.
    pub async fn wait_open(&self) -> Result<(), ChannelState> {
        let mut states = self.state_changes();
        let reached = states
            .wait_for(|state| state.is_open() || state.is_terminal())
            .await
            .map(|state| state.clone());
        match reached {
            Ok(ChannelState::Open) => Ok(()),
            Ok(other) => Err(other),
            Err(_) => Err(ChannelState::Closed),
        }
    }

    /// Resolves with the terminal state once the session has ended.
    pub async fn wait_terminated(&self) -> ChannelState {
        let mut states = self.state_changes();
        let reached = states
            .wait_for(ChannelState::is_terminal)
            .await
            .map(|state| state.clone());
        reached.unwrap_or(ChannelState::Closed)
    }

    /// Sends one packet. Before the channel opens, packets wait in a bounded
    /// queue that is flushed in order on open.
    pub async fn send(&self, packet: Bytes) -> Result<(), SendError> {
        {
            let mut pending = self.shared.pending.lock();
            match self.shared.state() {
                ChannelState::Open => {}
                ChannelState::Failed(reason) => return Err(SendError::Failed(reason)),
                ChannelState::Closed => return Err(SendError::Closed),
                _ => {
                    if pending.len() >= self.shared.max_pending {
                        return Err(SendError::QueueFull(self.shared.max_pending));
                    }
                    pending.push_back(packet);
                    return Ok(());
                }
            }
        }
        self.shared
            .peer
            .send(Frame::Packet(packet).encode())
            .await
            .map_err(|err| SendError::Channel(err.to_string()))
    }

    /// Next packet from the remote. Returns `None` once the session is
    /// terminal.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut states = self.state_changes();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            packet = inbound.recv() => packet,
            _ = states.wait_for(ChannelState::is_terminal) => None,
        }
    }

    /// Closes the session and waits for the channel to be released. Safe to
    /// call repeatedly and from any state.
    pub async fn close(&self) {
        self.shared.transition(ChannelState::Closed);
        self.shared.shutdown.notify_one();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                tracing::debug!(target = "webrtc", "session driver ended abnormally: {err}");
            }
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.shared.transition(ChannelState::Closed);
        self.shared.shutdown.notify_one();
    }
}

enum Stop {
    Closed,
    Failed(FailureReason),
}

impl From<NegotiationError> for Stop {
    fn from(err: NegotiationError) -> Self {
        Stop::Failed(FailureReason::Negotiation(err.to_string()))
    }
}

struct Driver {
    shared: Arc<Shared>,
    signaling: Arc<SignalingSession>,
    inbox: Option<SignalInbox>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    inbound: mpsc::Sender<Bytes>,
    deadline: Instant,
    negotiation_timeout: Duration,
    keepalive_interval: Duration,
    liveness_timeout: Duration,
    signal_retry_interval: Duration,
    handshake_id: Option<String>,
    /// Our offer, repeated until an answer arrives.
    offer: Option<Bytes>,
    /// Our answer, repeated whenever the same offer shows up again.
    answer: Option<Bytes>,
    remote_described: bool,
    held_candidates: Vec<(String, Bytes)>,
    held_local: Vec<Bytes>,
    sent_local: Vec<Bytes>,
    seen_remote: HashSet<Bytes>,
    early_messages: Vec<Bytes>,
}

impl Driver {
    async fn run(mut self) {
        let outcome = match self.negotiate().await {
            Ok(()) => self.pump().await,
            Err(stop) => stop,
        };
        if let Stop::Failed(reason) = outcome {
            self.shared.transition(ChannelState::Failed(reason));
        }
        // Free the remote for a fresh registration before releasing.
        self.inbox.take();
        self.shared.peer.close().await;
        tracing::debug!(
            target = "webrtc",
            remote = %self.shared.remote.short(),
            "data channel released"
        );
    }

    async fn negotiate(&mut self) -> Result<(), Stop> {
        match self.shared.role {
            NegotiationRole::Initiator => {
                let offer = self.shared.peer.create_offer().await?;
                let handshake_id = Uuid::new_v4().to_string();
                self.signal(SignalKind::Offer, &handshake_id, &offer)?;
                self.handshake_id = Some(handshake_id);
                self.offer = Some(offer);
                self.shared.transition(ChannelState::Offering);
                self.flush_local_candidates()?;
            }
            NegotiationRole::Responder => {
                self.shared.transition(ChannelState::AwaitingOffer);
            }
        }

        let timeout = tokio::time::sleep_until(self.deadline);
        tokio::pin!(timeout);
        let mut retry = tokio::time::interval_at(
            Instant::now() + self.signal_retry_interval,
            self.signal_retry_interval,
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if self.shared.state().is_terminal() {
                return Err(Stop::Closed);
            }
            let inbox = self.inbox.as_mut();
            tokio::select! {
                _ = self.shared.shutdown.notified() => return Err(Stop::Closed),
                _ = &mut timeout => {
                    return Err(Stop::Failed(FailureReason::NegotiationTimeout(
                        self.negotiation_timeout,
                    )));
                }
                _ = retry.tick(), if self.offer.is_some() && !self.remote_described => {
                    self.resend_offer()?;
                }
                message = next_signal(inbox) => match message {
                    Some(message) => self.on_signal(message).await?,
                    None => {
                        return Err(Stop::Failed(FailureReason::Signaling(
                            "relay connection lost during negotiation".into(),
                        )));
                    }
                },
                event = self.events.recv() => match event {
                    Some(PeerEvent::LocalCandidate(candidate)) => {
                        self.held_local.push(candidate);
                        if self.handshake_id.is_some() {
                            self.flush_local_candidates()?;
                        }
                    }
                    Some(PeerEvent::ChannelOpen) => return Ok(()),
                    Some(PeerEvent::Message(message)) => self.early_messages.push(message),
                    Some(PeerEvent::ChannelClosed) => {
                        return Err(Stop::Failed(FailureReason::Negotiation(
                            "data channel closed before opening".into(),
                        )));
                    }
                    Some(PeerEvent::ConnectionFailed(reason)) => {
                        return Err(Stop::Failed(FailureReason::Negotiation(reason)));
                    }
                    None => {
                        return Err(Stop::Failed(FailureReason::Negotiation(
                            "peer connection went away".into(),
                        )));
                    }
                },
            }
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) -> Result<(), Stop> {
        if message.from != self.shared.remote {
            tracing::trace!(
                target = "webrtc",
                from = %message.from.short(),
                "ignoring signal from unexpected peer"
            );
            return Ok(());
        }
        let Some((handshake_id, body)) = NegotiationPayload::decode(&message.payload) else {
            tracing::trace!(target = "webrtc", kind = message.kind.as_str(), "undecodable signal");
            return Ok(());
        };

        match (message.kind, self.shared.role) {
            (SignalKind::Offer, NegotiationRole::Responder) => {
                if let Some(current) = &self.handshake_id {
                    match &self.answer {
                        // Our answer was lost on the way.
                        Some(answer) if *current == handshake_id => {
                            tracing::debug!(
                                target = "webrtc",
                                remote = %self.shared.remote.short(),
                                "offer repeated, sending answer again"
                            );
                            self.signal(SignalKind::Answer, current, answer)?;
                            self.resend_local_candidates(current)?;
                        }
                        _ => {
                            tracing::trace!(target = "webrtc", "ignoring offer for another negotiation");
                        }
                    }
                    return Ok(());
                }
                let answer = self.shared.peer.accept_offer(body).await?;
                self.signal(SignalKind::Answer, &handshake_id, &answer)?;
                self.answer = Some(answer);
                self.handshake_id = Some(handshake_id);
                self.remote_described = true;
                self.shared.transition(ChannelState::Negotiating);
                self.apply_held_candidates().await;
                self.flush_local_candidates()?;
            }
            (SignalKind::Answer, NegotiationRole::Initiator) => {
                if self.remote_described || self.handshake_id.as_deref() != Some(&handshake_id) {
                    tracing::trace!(target = "webrtc", "ignoring stale or duplicate answer");
                    return Ok(());
                }
                self.shared.peer.apply_answer(body).await?;
                self.remote_described = true;
                self.shared.transition(ChannelState::Negotiating);
                self.apply_held_candidates().await;
            }
            (SignalKind::Candidate, _) => {
                if self
                    .handshake_id
                    .as_deref()
                    .is_some_and(|current| current != handshake_id)
                {
                    tracing::trace!(target = "webrtc", "ignoring candidate for another negotiation");
                    return Ok(());
                }
                if self.remote_described {
                    self.add_candidate(body).await;
                } else if self.held_candidates.len() < MAX_HELD_CANDIDATES {
                    self.held_candidates.push((handshake_id, body));
                } else {
                    tracing::debug!(target = "webrtc", "held candidate limit reached, dropping");
                }
            }
            (kind, role) => {
                tracing::trace!(
                    target = "webrtc",
                    kind = kind.as_str(),
                    ?role,
                    "ignoring signal not meant for this role"
                );
            }
        }
        Ok(())
    }

    async fn apply_held_candidates(&mut self) {
        let held = std::mem::take(&mut self.held_candidates);
        for (handshake_id, candidate) in held {
            if self.handshake_id.as_deref() == Some(handshake_id.as_str()) {
                self.add_candidate(candidate).await;
            }
        }
    }

    async fn add_candidate(&mut self, candidate: Bytes) {
        if !self.seen_remote.insert(candidate.clone()) {
            tracing::trace!(target = "webrtc", "ignoring duplicate candidate");
            return;
        }
        if let Err(err) = self.shared.peer.add_remote_candidate(candidate).await {
            tracing::trace!(target = "webrtc", "remote candidate rejected: {err}");
        }
    }

    fn flush_local_candidates(&mut self) -> Result<(), Stop> {
        let Some(handshake_id) = self.handshake_id.clone() else {
            return Ok(());
        };
        for candidate in std::mem::take(&mut self.held_local) {
            self.signal(SignalKind::Candidate, &handshake_id, &candidate)?;
            self.sent_local.push(candidate);
        }
        Ok(())
    }

    fn resend_offer(&self) -> Result<(), Stop> {
        let (Some(handshake_id), Some(offer)) = (&self.handshake_id, &self.offer) else {
            return Ok(());
        };
        tracing::debug!(
            target = "webrtc",
            remote = %self.shared.remote.short(),
            "no answer yet, sending offer again"
        );
        self.signal(SignalKind::Offer, handshake_id, offer)?;
        self.resend_local_candidates(handshake_id)
    }

    fn resend_local_candidates(&self, handshake_id: &str) -> Result<(), Stop> {
        for candidate in &self.sent_local {
            self.signal(SignalKind::Candidate, handshake_id, candidate)?;
        }
        Ok(())
    }

    fn signal(&self, kind: SignalKind, handshake_id: &str, body: &[u8]) -> Result<(), Stop> {
        let message = SignalingMessage::new(
            self.shared.local,
            self.shared.remote,
            kind,
            NegotiationPayload::encode(handshake_id, body),
        );
        self.signaling
            .send(message)
            .map_err(|err| Stop::Failed(FailureReason::Signaling(err.to_string())))
    }

    async fn pump(&mut self) -> Stop {
        let Some(queued) = self.shared.open_and_drain() else {
            return Stop::Closed;
        };
        for packet in queued {
            if let Err(err) = self.shared.peer.send(Frame::Packet(packet).encode()).await {
                tracing::debug!(target = "webrtc", "dropping queued packet: {err}");
            }
        }
        let mut last_seen = Instant::now();
        for message in std::mem::take(&mut self.early_messages) {
            self.on_message(message).await;
        }

        let mut ticker = tokio::time::interval(self.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut nonce: u64 = 0;

        loop {
            let inbox = self.inbox.as_mut();
            tokio::select! {
                _ = self.shared.shutdown.notified() => return Stop::Closed,
                _ = ticker.tick() => {
                    let silent_for = last_seen.elapsed();
                    if silent_for >= self.liveness_timeout {
                        return Stop::Failed(FailureReason::LivenessLost(self.liveness_timeout));
                    }
                    nonce = nonce.wrapping_add(1);
                    if let Err(err) = self.shared.peer.send(Frame::Ping(nonce).encode()).await {
                        return Stop::Failed(FailureReason::ChannelLost(err.to_string()));
                    }
                }
                event = self.events.recv() => match event {
                    Some(PeerEvent::Message(message)) => {
                        last_seen = Instant::now();
                        self.on_message(message).await;
                    }
                    Some(PeerEvent::LocalCandidate(candidate)) => {
                        if let Some(handshake_id) = self.handshake_id.clone() {
                            if let Err(Stop::Failed(reason)) =
                                self.signal(SignalKind::Candidate, &handshake_id, &candidate)
                            {
                                tracing::trace!(target = "webrtc", "late candidate not sent: {reason}");
                            }
                        }
                    }
                    Some(PeerEvent::ChannelOpen) => {}
                    Some(PeerEvent::ChannelClosed) => {
                        return Stop::Failed(FailureReason::ChannelLost(
                            "data channel closed".into(),
                        ));
                    }
                    Some(PeerEvent::ConnectionFailed(reason)) => {
                        return Stop::Failed(FailureReason::ChannelLost(reason));
                    }
                    None => {
                        return Stop::Failed(FailureReason::ChannelLost(
                            "peer connection went away".into(),
                        ));
                    }
                },
                message = next_signal(inbox) => match message {
                    Some(message) if message.kind == SignalKind::Candidate => {
                        if let Some((handshake_id, body)) = NegotiationPayload::decode(&message.payload) {
                            if self.handshake_id.as_deref() == Some(handshake_id.as_str()) {
                                self.add_candidate(body).await;
                            }
                        }
                    }
                    Some(_) => {
                        tracing::trace!(target = "webrtc", "ignoring signal on open channel");
                    }
                    None => {
                        // The channel no longer needs the relay.
                        tracing::debug!(target = "webrtc", "signaling gone while channel open");
                        self.inbox = None;
                    }
                },
            }
        }
    }

    async fn on_message(&self, message: Bytes) {
        match Frame::decode(&message) {
            Some(Frame::Packet(packet)) => {
                if let Err(err) = self.inbound.try_send(packet) {
                    tracing::trace!(target = "webrtc", "dropping inbound packet: {err}");
                }
            }
            Some(Frame::Ping(nonce)) => {
                if let Err(err) = self.shared.peer.send(Frame::Pong(nonce).encode()).await {
                    tracing::debug!(target = "webrtc", "pong failed: {err}");
                }
            }
            Some(Frame::Pong(_)) => {}
            None => {
                tracing::trace!(target = "webrtc", len = message.len(), "malformed frame");
            }
        }
    }
}

async fn next_signal(inbox: Option<&mut SignalInbox>) -> Option<SignalingMessage> {
    match inbox {
        Some(inbox) => inbox.recv().await,
        None => std::future::pending().await,
    }
}
