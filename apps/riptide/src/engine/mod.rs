//! The tunnel engine seam and the in-process interface it feeds.

mod settings;
mod wireguard;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use transport_webrtc::{Bind, TransportError};

pub use settings::{EngineSettings, SettingsError};
pub use wireguard::WireGuardEngine;

/// IP packets buffered in each direction between interface and engine.
pub const DEFAULT_INTERFACE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid engine settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("engine has no settings")]
    NotConfigured,
    #[error("engine is already running")]
    Running,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("tunnel interface closed")]
    InterfaceClosed,
}

/// An encrypted tunnel that moves IP packets between a [`TunnelInterface`]
/// and a datagram [`Bind`].
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Applies settings in the `key=value` text form.
    fn ipc_set(&self, settings: &str) -> Result<(), EngineError>;
    /// Opens the transport and starts moving packets.
    async fn up(&self, port: InterfacePort, bind: Arc<dyn Bind>) -> Result<(), EngineError>;
    /// Stops the engine and closes its transport. Idempotent.
    async fn down(&self);
}

/// The application side of the tunnel: plaintext IPv4 packets in and out.
pub struct TunnelInterface {
    address: Ipv4Addr,
    outbound: mpsc::Sender<Bytes>,
    inbound: AsyncMutex<mpsc::Receiver<Bytes>>,
}

/// The engine side of a [`TunnelInterface`].
pub struct InterfacePort {
    /// Packets the application wants sent through the tunnel.
    pub outbound: mpsc::Receiver<Bytes>,
    /// Packets that arrived through the tunnel.
    pub inbound: mpsc::Sender<Bytes>,
}

impl TunnelInterface {
    pub fn new(address: Ipv4Addr, capacity: usize) -> (Arc<Self>, InterfacePort) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let interface = Arc::new(Self {
            address,
            outbound: outbound_tx,
            inbound: AsyncMutex::new(inbound_rx),
        });
        let port = InterfacePort {
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        (interface, port)
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub async fn send_packet(&self, packet: Bytes) -> Result<(), EngineError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| EngineError::InterfaceClosed)
    }

    /// Next packet delivered by the engine. `None` once the engine is gone.
    pub async fn recv_packet(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }
}
