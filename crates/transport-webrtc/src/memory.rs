//! In-process peer connections for tests and single-process demos.
//!
//! Offers, answers and candidates are small tokens that only make sense to
//! the [`MemoryNetwork`] that issued them, so sessions still have to carry
//! them over real signaling before a channel opens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{NegotiationError, NegotiationRole, PeerEvent, PeerFactory, PeerHandle, RtcPeer};

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";
const CANDIDATE_PREFIX: &str = "memory-candidate:";

#[derive(Default)]
struct LinkFlags {
    severed: AtomicBool,
    silenced: AtomicBool,
}

struct PeerCore {
    id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    link: Mutex<Option<PeerLink>>,
    closed: AtomicBool,
}

#[derive(Clone)]
struct PeerLink {
    remote: Weak<PeerCore>,
    flags: Arc<LinkFlags>,
}

impl PeerCore {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    offers: HashMap<u64, Arc<PeerCore>>,
    answers: HashMap<u64, Arc<PeerCore>>,
    links: Vec<MemoryLink>,
}

/// Shared fabric that pairs memory peers and injects faults.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    releases: Arc<AtomicUsize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> MemoryPeerFactory {
        MemoryPeerFactory {
            network: self.clone(),
        }
    }

    /// Every channel that has opened on this network, oldest first.
    pub fn links(&self) -> Vec<MemoryLink> {
        self.state.lock().links.clone()
    }

    /// Number of peers that have released their channel.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn register_offer(&self, core: &Arc<PeerCore>) -> u64 {
        let mut state = self.state.lock();
        state.offers.insert(core.id, Arc::clone(core));
        core.id
    }

    fn accept(&self, token: u64, responder: &Arc<PeerCore>) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if !state.offers.contains_key(&token) {
            return Err(NegotiationError::InvalidDescription(format!(
                "unknown memory offer {token}"
            )));
        }
        state.answers.insert(token, Arc::clone(responder));
        Ok(())
    }

    fn complete(&self, token: u64) -> Result<(), NegotiationError> {
        let (offerer, responder, link) = {
            let mut state = self.state.lock();
            let offerer = state.offers.remove(&token);
            let responder = state.answers.remove(&token);
            let (Some(offerer), Some(responder)) = (offerer, responder) else {
                return Err(NegotiationError::InvalidDescription(format!(
                    "no answer registered for memory offer {token}"
                )));
            };
            let link = MemoryLink {
                flags: Arc::new(LinkFlags::default()),
                initiator: Arc::downgrade(&offerer),
                responder: Arc::downgrade(&responder),
            };
            state.links.push(link.clone());
            (offerer, responder, link)
        };

        *offerer.link.lock() = Some(PeerLink {
            remote: Arc::downgrade(&responder),
            flags: Arc::clone(&link.flags),
        });
        *responder.link.lock() = Some(PeerLink {
            remote: Arc::downgrade(&offerer),
            flags: Arc::clone(&link.flags),
        });
        offerer.emit(PeerEvent::ChannelOpen);
        responder.emit(PeerEvent::ChannelOpen);
        Ok(())
    }

    fn allocate(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.next_id
    }
}

/// Handle on one opened memory channel.
#[derive(Clone)]
pub struct MemoryLink {
    flags: Arc<LinkFlags>,
    initiator: Weak<PeerCore>,
    responder: Weak<PeerCore>,
}

impl MemoryLink {
    /// Tears the channel down loudly: both ends see the channel close.
    pub fn sever(&self) {
        if self.flags.severed.swap(true, Ordering::SeqCst) {
            return;
        }
        for side in [&self.initiator, &self.responder] {
            if let Some(core) = side.upgrade() {
                core.emit(PeerEvent::ChannelClosed);
            }
        }
    }

    /// Kills the channel silently: messages vanish, no events fire.
    pub fn silence(&self) {
        self.flags.silenced.store(true, Ordering::SeqCst);
    }

    pub fn is_severed(&self) -> bool {
        self.flags.severed.load(Ordering::SeqCst)
    }
}

pub struct MemoryPeerFactory {
    network: MemoryNetwork,
}

#[async_trait]
impl PeerFactory for MemoryPeerFactory {
    async fn create_peer(&self, role: NegotiationRole) -> Result<PeerHandle, NegotiationError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let core = Arc::new(PeerCore {
            id: self.network.allocate(),
            events: events_tx,
            link: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        tracing::trace!(target = "webrtc", id = core.id, ?role, "memory peer created");
        Ok(PeerHandle {
            peer: Arc::new(MemoryPeer {
                core,
                network: self.network.clone(),
            }),
            events: events_rx,
        })
    }
}

struct MemoryPeer {
    core: Arc<PeerCore>,
    network: MemoryNetwork,
}

impl MemoryPeer {
    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.core.closed.load(Ordering::SeqCst) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn gather_candidate(&self) {
        self.core.emit(PeerEvent::LocalCandidate(Bytes::from(format!(
            "{CANDIDATE_PREFIX}{}",
            self.core.id
        ))));
    }
}

fn parse_token(raw: &[u8], prefix: &str) -> Result<u64, NegotiationError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.strip_prefix(prefix))
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| {
            NegotiationError::InvalidDescription(format!(
                "expected {prefix}<token>, got {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

#[async_trait]
impl RtcPeer for MemoryPeer {
    async fn create_offer(&self) -> Result<Bytes, NegotiationError> {
        self.ensure_open()?;
        let token = self.network.register_offer(&self.core);
        self.gather_candidate();
        Ok(Bytes::from(format!("{OFFER_PREFIX}{token}")))
    }

    async fn accept_offer(&self, offer: Bytes) -> Result<Bytes, NegotiationError> {
        self.ensure_open()?;
        let token = parse_token(&offer, OFFER_PREFIX)?;
        self.network.accept(token, &self.core)?;
        self.gather_candidate();
        Ok(Bytes::from(format!("{ANSWER_PREFIX}{token}")))
    }

    async fn apply_answer(&self, answer: Bytes) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let token = parse_token(&answer, ANSWER_PREFIX)?;
        self.network.complete(token)
    }

    async fn add_remote_candidate(&self, candidate: Bytes) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        parse_token(&candidate, CANDIDATE_PREFIX)
            .map(|_| ())
            .map_err(|err| NegotiationError::InvalidCandidate(err.to_string()))
    }

    async fn send(&self, message: Bytes) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let link = self
            .core
            .link
            .lock()
            .clone()
            .ok_or(NegotiationError::ChannelUnavailable)?;
        if link.flags.severed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        if link.flags.silenced.load(Ordering::SeqCst) {
            return Ok(());
        }
        match link.remote.upgrade() {
            Some(remote) if !remote.closed.load(Ordering::SeqCst) => {
                remote.emit(PeerEvent::Message(message));
                Ok(())
            }
            _ => Err(NegotiationError::Closed),
        }
    }

    async fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.releases.fetch_add(1, Ordering::SeqCst);
        let link = self.core.link.lock().take();
        if let Some(link) = link {
            let silenced = link.flags.silenced.load(Ordering::SeqCst);
            if !silenced && !link.flags.severed.swap(true, Ordering::SeqCst) {
                if let Some(remote) = link.remote.upgrade() {
                    remote.emit(PeerEvent::ChannelClosed);
                }
            }
        }
        let mut state = self.network.state.lock();
        state.offers.remove(&self.core.id);
        state.answers.retain(|_, core| core.id != self.core.id);
    }
}
