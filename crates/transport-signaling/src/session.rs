use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use crate::protocol::{ClientMessage, ServerMessage, SignalEnvelope};
use crate::{ConnectError, PeerIdentity, SendError, SignalingConfig, SignalingMessage};

/// Both directions of a joined-or-joining relay connection, independent of
/// what carries the frames.
pub(crate) struct RelayLink {
    pub(crate) outbound: mpsc::UnboundedSender<ClientMessage>,
    pub(crate) inbound: mpsc::UnboundedReceiver<ServerMessage>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

struct Subscriber {
    identity: PeerIdentity,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

/// A joined connection to a signaling relay.
///
/// Writes are serialized through a single writer task. Inbound signals are
/// dispatched to every live [`Subscription`] for the addressed identity.
pub struct SignalingSession {
    local: PeerIdentity,
    endpoint: String,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    open: AtomicBool,
    closed: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingSession {
    pub async fn connect(
        endpoint: &str,
        local: PeerIdentity,
    ) -> Result<Arc<Self>, ConnectError> {
        Self::connect_with_config(endpoint, local, SignalingConfig::default()).await
    }

    pub async fn connect_with_config(
        endpoint: &str,
        local: PeerIdentity,
        config: SignalingConfig,
    ) -> Result<Arc<Self>, ConnectError> {
        config.validate()?;
        let url = relay_url(endpoint)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ConnectError::Unreachable(format!("{url}: {err}")))?;
        tracing::debug!(target = "signaling", url = %url, "relay websocket connected");
        let link = websocket_link(ws_stream);
        Self::establish(link, local, url.to_string(), config).await
    }

    /// Sends the join over `link`, waits for the acknowledgement and starts
    /// dispatching.
    pub(crate) async fn establish(
        link: RelayLink,
        local: PeerIdentity,
        endpoint: String,
        config: SignalingConfig,
    ) -> Result<Arc<Self>, ConnectError> {
        let RelayLink {
            outbound,
            mut inbound,
            tasks,
        } = link;
        if let Err(err) = config.validate() {
            tasks.iter().for_each(JoinHandle::abort);
            return Err(err);
        }

        let session = Arc::new(SignalingSession {
            local,
            endpoint,
            outbound,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            tasks: Mutex::new(tasks),
        });

        session
            .outbound
            .send(ClientMessage::Join { peer_id: local })
            .map_err(|_| ConnectError::Closed)?;
        tracing::debug!(target = "signaling", identity = %local.short(), "sent join");

        let ack = tokio::time::timeout(config.join_timeout, await_join(&mut inbound, local)).await;
        match ack {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                session.close();
                return Err(err);
            }
            Err(_) => {
                session.close();
                return Err(ConnectError::JoinTimeout(config.join_timeout));
            }
        }
        session.open.store(true, Ordering::SeqCst);

        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(&session), inbound));

        let heartbeat_tx = session.outbound.clone();
        let heartbeat_interval = config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        session.tasks.lock().extend([dispatcher, heartbeat]);
        tracing::info!(
            target = "signaling",
            identity = %local.short(),
            endpoint = %session.endpoint,
            "joined signaling relay"
        );
        Ok(session)
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queues `message` for the relay. Fails immediately when the relay
    /// connection is gone; callers decide whether to retry.
    pub fn send(&self, message: SignalingMessage) -> Result<(), SendError> {
        if message.from != self.local {
            return Err(SendError::ForeignSender {
                expected: self.local,
                actual: message.from,
            });
        }
        if !self.is_open() {
            return Err(SendError::NotConnected);
        }
        tracing::trace!(
            target = "signaling",
            to = %message.to.short(),
            kind = message.kind.as_str(),
            len = message.payload.len(),
            "signal out"
        );
        self.outbound
            .send(ClientMessage::Signal {
                to_peer: message.to,
                signal: SignalEnvelope {
                    kind: message.kind,
                    payload: message.payload,
                },
            })
            .map_err(|_| SendError::NotConnected)
    }

    /// Messages addressed to `identity`, in arrival order. The sequence ends
    /// when the session closes or the relay connection drops. Subscribing
    /// again starts a fresh sequence.
    pub fn subscribe(&self, identity: PeerIdentity) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        if self.is_open() {
            subscribers.push(Subscriber { identity, tx });
        } else {
            tracing::debug!(
                target = "signaling",
                identity = %identity.short(),
                "subscribe on a closed session yields nothing"
            );
        }
        Subscription { identity, rx }
    }

    /// Releases the relay connection and ends every subscription.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.subscribers.lock().clear();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        tracing::debug!(target = "signaling", identity = %self.local.short(), "session closed");
    }

    fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Signal { from_peer, signal } => {
                self.dispatch(SignalingMessage {
                    from: from_peer,
                    to: self.local,
                    kind: signal.kind,
                    payload: signal.payload,
                });
            }
            ServerMessage::Pong => {
                tracing::trace!(target = "signaling", "pong");
            }
            ServerMessage::Error { message } => {
                tracing::warn!(target = "signaling", "relay reported error: {message}");
            }
            other => {
                tracing::debug!(target = "signaling", message = ?other, "unexpected relay message");
            }
        }
    }

    fn dispatch(&self, message: SignalingMessage) {
        tracing::trace!(
            target = "signaling",
            from = %message.from.short(),
            kind = message.kind.as_str(),
            len = message.payload.len(),
            "signal in"
        );
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if subscriber.identity != message.to {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(message.clone()).is_ok()
        });
    }

    fn mark_disconnected(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::warn!(
                target = "signaling",
                identity = %self.local.short(),
                "relay connection lost"
            );
        }
        self.subscribers.lock().clear();
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Messages delivered to one identity. See [`SignalingSession::subscribe`].
pub struct Subscription {
    identity: PeerIdentity,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl Subscription {
    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    pub async fn next_message(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = SignalingMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

async fn await_join(
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
    local: PeerIdentity,
) -> Result<(), ConnectError> {
    while let Some(message) = inbound.recv().await {
        match message {
            ServerMessage::JoinSuccess { peer_id } if peer_id == local => return Ok(()),
            ServerMessage::JoinSuccess { peer_id } => {
                return Err(ConnectError::Rejected(format!(
                    "relay acknowledged {peer_id} instead of {local}"
                )));
            }
            ServerMessage::JoinError { reason } => return Err(ConnectError::Rejected(reason)),
            other => {
                tracing::trace!(target = "signaling", message = ?other, "ignored before join");
            }
        }
    }
    Err(ConnectError::Closed)
}

async fn dispatch_loop(
    session: Weak<SignalingSession>,
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        session.handle_server_message(message);
    }
    if let Some(session) = session.upgrade() {
        session.mark_disconnected();
    }
}

fn websocket_link(ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> RelayLink {
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(target = "signaling", "failed to encode relay frame: {err}");
                    continue;
                }
            };
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            let forwarded = match frame {
                Ok(Message::Text(text)) => forward_frame(&inbound_tx, text.as_bytes()),
                Ok(Message::Binary(data)) => forward_frame(&inbound_tx, &data),
                Ok(Message::Close(_)) => break,
                Ok(_) => true,
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "signaling", "relay websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "signaling", "relay websocket error: {err}");
                        }
                    }
                    break;
                }
            };
            if !forwarded {
                break;
            }
        }
    });

    RelayLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
        tasks: vec![writer, reader],
    }
}

fn forward_frame(inbound: &mpsc::UnboundedSender<ServerMessage>, raw: &[u8]) -> bool {
    tracing::trace!(target = "signaling", event = "ws_in", len = raw.len());
    match serde_json::from_slice::<ServerMessage>(raw) {
        Ok(message) => inbound.send(message).is_ok(),
        Err(err) => {
            tracing::trace!(target = "signaling", "ignoring unrecognised relay frame: {err}");
            true
        }
    }
}

/// Normalises a relay endpoint to a websocket URL. `http` and `https` map to
/// `ws` and `wss`; any other scheme is rejected.
pub fn relay_url(endpoint: &str) -> Result<Url, ConnectError> {
    let invalid = |reason: String| ConnectError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let mut url = Url::parse(endpoint.trim()).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    };
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".into()));
    }
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot use scheme {scheme}")))?;
    url.set_fragment(None);
    Ok(url)
}
