use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, watch};
use transport_signaling::PeerIdentity;
use url::Url;

use crate::{
    ChannelSession, ChannelState, NegotiationRole, PeerFactory, SendError, SignalRouter,
    TransportError, WebRtcConfig,
};

pub const ENDPOINT_SCHEME: &str = "webrtc";
/// Descriptor that resolves to whatever peer the transport is bound to.
pub const DATACHANNEL_ENDPOINT: &str = "webrtc://datachannel";

/// Where a packet goes. A data-channel transport serves exactly one remote,
/// so this is that remote's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    remote: PeerIdentity,
}

impl Endpoint {
    pub fn new(remote: PeerIdentity) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> PeerIdentity {
        self.remote
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ENDPOINT_SCHEME}://{}", self.remote.to_base64url())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.remote.short())
    }
}

/// The datagram-socket contract a tunnel engine drives its transport
/// through.
#[async_trait]
pub trait Bind: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;
    async fn send(&self, endpoint: &Endpoint, packet: Bytes) -> Result<(), SendError>;
    /// Next `(sender, packet)`. `None` once the transport has terminated.
    async fn recv(&self) -> Option<(Endpoint, Bytes)>;
    async fn close(&self);
    fn parse_endpoint(&self, descriptor: &str) -> Result<Endpoint, TransportError>;
}

/// [`Bind`] over a negotiated data channel to one remote peer.
pub struct DataChannelBind {
    router: Arc<SignalRouter>,
    factory: Arc<dyn PeerFactory>,
    config: WebRtcConfig,
    remote: PeerIdentity,
    role: NegotiationRole,
    session: RwLock<Option<Arc<ChannelSession>>>,
    open_lock: AsyncMutex<()>,
    closed: AtomicBool,
}

impl DataChannelBind {
    pub fn new(
        router: Arc<SignalRouter>,
        factory: Arc<dyn PeerFactory>,
        remote: PeerIdentity,
        role: NegotiationRole,
        config: WebRtcConfig,
    ) -> Self {
        Self {
            router,
            factory,
            config,
            remote,
            role,
            session: RwLock::new(None),
            open_lock: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> PeerIdentity {
        self.remote
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn session(&self) -> Option<Arc<ChannelSession>> {
        self.session.read().clone()
    }

    /// `Idle` until the first `open()`.
    pub fn state(&self) -> ChannelState {
        self.session()
            .map_or(ChannelState::Idle, |session| session.state())
    }

    pub fn state_changes(&self) -> Option<watch::Receiver<ChannelState>> {
        self.session().map(|session| session.state_changes())
    }

    pub async fn wait_open(&self) -> Result<(), ChannelState> {
        match self.session() {
            Some(session) => session.wait_open().await,
            None => Err(ChannelState::Idle),
        }
    }

    pub async fn wait_terminated(&self) -> ChannelState {
        match self.session() {
            Some(session) => session.wait_terminated().await,
            None => ChannelState::Closed,
        }
    }
}

#[async_trait]
impl Bind for DataChannelBind {
    /// Starts negotiating. Calling it while a session is live is a no-op;
    /// calling it after the session ended starts a fresh one.
    async fn open(&self) -> Result<(), TransportError> {
        let _guard = self.open_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if let Some(current) = self.session() {
            if !current.state().is_terminal() {
                return Ok(());
            }
            // The old driver frees its inbox on its way out.
            current.close().await;
        }

        let inbox = self.router.register(self.remote)?;
        let session = ChannelSession::open(
            self.router.local_identity(),
            self.remote,
            self.role,
            &self.config,
            self.factory.as_ref(),
            Arc::clone(self.router.signaling()),
            inbox,
        )
        .await?;
        tracing::debug!(
            target = "webrtc",
            remote = %self.remote.short(),
            role = ?self.role,
            "transport opened"
        );
        *self.session.write() = Some(Arc::new(session));
        Ok(())
    }

    async fn send(&self, endpoint: &Endpoint, packet: Bytes) -> Result<(), SendError> {
        if endpoint.remote != self.remote {
            return Err(SendError::WrongEndpoint(endpoint.to_string()));
        }
        let session = self.session().ok_or(SendError::NotOpen)?;
        session.send(packet).await
    }

    async fn recv(&self) -> Option<(Endpoint, Bytes)> {
        let session = self.session()?;
        let packet = session.recv().await?;
        Some((Endpoint::new(self.remote), packet))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.open_lock.lock().await;
        if let Some(session) = self.session() {
            session.close().await;
        }
    }

    fn parse_endpoint(&self, descriptor: &str) -> Result<Endpoint, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            descriptor: descriptor.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(descriptor.trim()).map_err(|err| invalid(&err.to_string()))?;
        if url.scheme() != ENDPOINT_SCHEME {
            return Err(invalid("scheme must be webrtc"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing peer"))?;
        if host == "datachannel" {
            return Ok(Endpoint::new(self.remote));
        }
        let named = PeerIdentity::from_base64url(host).map_err(|err| invalid(&err.to_string()))?;
        if named != self.remote {
            return Err(invalid("names a peer this transport is not bound to"));
        }
        Ok(Endpoint::new(named))
    }
}
