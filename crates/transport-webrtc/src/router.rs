use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use transport_signaling::{PeerIdentity, SignalingMessage, SignalingSession};

use crate::TransportError;
use crate::config::DEFAULT_EARLY_SIGNAL_LIMIT;

struct Route {
    generation: u64,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

struct RouterState {
    routes: HashMap<PeerIdentity, Route>,
    early: HashMap<PeerIdentity, VecDeque<SignalingMessage>>,
    early_limit: usize,
    next_generation: u64,
    closed: bool,
}

impl RouterState {
    fn route(&mut self, message: SignalingMessage) {
        let from = message.from;
        let message = match self.routes.get(&from) {
            Some(route) => match route.tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => {
                    self.routes.remove(&from);
                    message
                }
            },
            None => message,
        };

        let queue = self.early.entry(from).or_default();
        queue.push_back(message);
        if queue.len() > self.early_limit {
            if let Some(dropped) = queue.pop_front() {
                tracing::debug!(
                    target = "webrtc",
                    from = %from.short(),
                    kind = dropped.kind.as_str(),
                    limit = self.early_limit,
                    "early signal buffer full, dropping oldest"
                );
            }
        }
    }
}

/// Demultiplexes one relay subscription into per-remote session inboxes.
///
/// Signals from a remote with no registered session are held (bounded) and
/// replayed when a session registers. Only one live inbox exists per remote.
pub struct SignalRouter {
    signaling: Arc<SignalingSession>,
    state: Arc<Mutex<RouterState>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SignalRouter {
    pub fn new(signaling: Arc<SignalingSession>) -> Arc<Self> {
        Self::with_early_limit(signaling, DEFAULT_EARLY_SIGNAL_LIMIT)
    }

    pub fn with_early_limit(signaling: Arc<SignalingSession>, early_limit: usize) -> Arc<Self> {
        let state = Arc::new(Mutex::new(RouterState {
            routes: HashMap::new(),
            early: HashMap::new(),
            early_limit,
            next_generation: 0,
            closed: false,
        }));
        let mut subscription = signaling.subscribe(signaling.local_identity());
        let pump_state = Arc::clone(&state);
        let pump = tokio::spawn(async move {
            while let Some(message) = subscription.next_message().await {
                pump_state.lock().route(message);
            }
            let mut state = pump_state.lock();
            state.closed = true;
            state.routes.clear();
            tracing::debug!(target = "webrtc", "signal router stopped");
        });
        Arc::new(Self {
            signaling,
            state,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn signaling(&self) -> &Arc<SignalingSession> {
        &self.signaling
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.signaling.local_identity()
    }

    /// Claims the inbox for `remote`, replaying anything that arrived early.
    pub fn register(&self, remote: PeerIdentity) -> Result<SignalInbox, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state
            .routes
            .get(&remote)
            .is_some_and(|route| !route.tx.is_closed())
        {
            return Err(TransportError::SessionActive(remote));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let early = state.early.remove(&remote).unwrap_or_default();
        if !early.is_empty() {
            tracing::debug!(
                target = "webrtc",
                remote = %remote.short(),
                count = early.len(),
                "replaying early signals"
            );
        }
        for message in early {
            let _ = tx.send(message);
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state.routes.insert(remote, Route { generation, tx });

        Ok(SignalInbox {
            remote,
            generation,
            rx,
            state: Arc::downgrade(&self.state),
        })
    }

    /// Number of signals held for a remote with no registered session.
    pub fn buffered(&self, remote: &PeerIdentity) -> usize {
        self.state.lock().early.get(remote).map_or(0, VecDeque::len)
    }

    /// Stops routing. Registered inboxes end.
    pub fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let mut state = self.state.lock();
        state.closed = true;
        state.routes.clear();
        state.early.clear();
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// Signals from one remote, in arrival order. Ends when the router or the
/// relay connection goes away. Dropping it frees the remote for a new
/// registration.
pub struct SignalInbox {
    remote: PeerIdentity,
    generation: u64,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
    state: Weak<Mutex<RouterState>>,
}

impl SignalInbox {
    pub fn remote(&self) -> PeerIdentity {
        self.remote
    }

    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }
}

impl Drop for SignalInbox {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock();
        if state
            .routes
            .get(&self.remote)
            .is_some_and(|route| route.generation == self.generation)
        {
            state.routes.remove(&self.remote);
        }
    }
}
