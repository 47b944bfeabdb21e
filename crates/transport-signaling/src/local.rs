use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::RelayLink;
use crate::{ConnectError, PeerIdentity, SignalingConfig, SignalingSession};

const LOCAL_ENDPOINT: &str = "local://relay";

struct LocalPeer {
    tx: mpsc::UnboundedSender<ServerMessage>,
    severed: Arc<Notify>,
}

/// An in-process relay speaking the same frames as the network relay.
///
/// Each joined identity gets one slot; a second join for a connected
/// identity is rejected. Signals for identities that are not connected are
/// dropped, which is what the network relay does too.
#[derive(Clone, Default)]
pub struct LocalRelay {
    peers: Arc<Mutex<HashMap<PeerIdentity, LocalPeer>>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, local: PeerIdentity) -> Result<Arc<SignalingSession>, ConnectError> {
        self.connect_with_config(local, SignalingConfig::default())
            .await
    }

    pub async fn connect_with_config(
        &self,
        local: PeerIdentity,
        config: SignalingConfig,
    ) -> Result<Arc<SignalingSession>, ConnectError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let severed = Arc::new(Notify::new());

        let relay = self.clone();
        let connection_severed = Arc::clone(&severed);
        let pump = tokio::spawn(async move {
            let mut joined = None;
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => relay.handle(&mut joined, &inbound_tx, &connection_severed, message),
                        None => break,
                    },
                    _ = connection_severed.notified() => break,
                }
            }
            if let Some(identity) = joined {
                relay.leave(&identity, &inbound_tx);
            }
        });

        let link = RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            tasks: vec![pump],
        };
        SignalingSession::establish(link, local, LOCAL_ENDPOINT.to_string(), config).await
    }

    pub fn is_connected(&self, identity: &PeerIdentity) -> bool {
        self.peers
            .lock()
            .get(identity)
            .is_some_and(|peer| !peer.tx.is_closed())
    }

    /// Drops the relay side of `identity`'s connection, as a network failure
    /// would. Returns whether the identity was connected.
    pub fn disconnect(&self, identity: &PeerIdentity) -> bool {
        let removed = self.peers.lock().remove(identity);
        match removed {
            Some(peer) => {
                peer.severed.notify_one();
                tracing::debug!(target = "signaling", identity = %identity.short(), "local relay dropped peer");
                true
            }
            None => false,
        }
    }

    fn handle(
        &self,
        joined: &mut Option<PeerIdentity>,
        reply: &mpsc::UnboundedSender<ServerMessage>,
        severed: &Arc<Notify>,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::Join { peer_id } => {
                let mut peers = self.peers.lock();
                if peers.get(&peer_id).is_some_and(|peer| !peer.tx.is_closed()) {
                    let _ = reply.send(ServerMessage::JoinError {
                        reason: format!("identity {peer_id} is already connected"),
                    });
                    return;
                }
                peers.insert(
                    peer_id,
                    LocalPeer {
                        tx: reply.clone(),
                        severed: Arc::clone(severed),
                    },
                );
                *joined = Some(peer_id);
                let _ = reply.send(ServerMessage::JoinSuccess { peer_id });
            }
            ClientMessage::Signal { to_peer, signal } => {
                let Some(from_peer) = *joined else {
                    let _ = reply.send(ServerMessage::Error {
                        message: "join before signaling".into(),
                    });
                    return;
                };
                let target = self.peers.lock().get(&to_peer).map(|peer| peer.tx.clone());
                match target {
                    Some(tx) => {
                        let _ = tx.send(ServerMessage::Signal { from_peer, signal });
                    }
                    None => {
                        tracing::trace!(
                            target = "signaling",
                            to = %to_peer.short(),
                            "local relay dropping signal for absent peer"
                        );
                    }
                }
            }
            ClientMessage::Ping => {
                let _ = reply.send(ServerMessage::Pong);
            }
        }
    }

    fn leave(&self, identity: &PeerIdentity, reply: &mpsc::UnboundedSender<ServerMessage>) {
        let mut peers = self.peers.lock();
        if peers
            .get(identity)
            .is_some_and(|peer| peer.tx.same_channel(reply))
        {
            peers.remove(identity);
        }
    }
}
