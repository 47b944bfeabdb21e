use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use transport_webrtc::{Bind, DATACHANNEL_ENDPOINT, Endpoint};

use super::{EngineError, EngineSettings, InterfacePort, TunnelEngine};

/// boringtun expects its timers to be driven at least this often.
const TIMER_TICK: Duration = Duration::from_millis(250);
/// Largest IP packet plus WireGuard framing.
const BUFFER_LEN: usize = u16::MAX as usize + 256;

/// [`TunnelEngine`] backed by boringtun's WireGuard implementation, with a
/// single peer reached through whatever [`Bind`] it is given.
#[derive(Default)]
pub struct WireGuardEngine {
    settings: Mutex<Option<EngineSettings>>,
    running: Mutex<Option<Running>>,
}

struct Running {
    bind: Arc<dyn Bind>,
    tasks: Vec<JoinHandle<()>>,
}

impl WireGuardEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> Option<EngineSettings> {
        self.settings.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait]
impl TunnelEngine for WireGuardEngine {
    fn ipc_set(&self, settings: &str) -> Result<(), EngineError> {
        let settings = EngineSettings::from_uapi(settings)?;
        if self.is_running() {
            return Err(EngineError::Running);
        }
        tracing::debug!(target = "engine", ?settings, "settings applied");
        *self.settings.lock() = Some(settings);
        Ok(())
    }

    async fn up(&self, port: InterfacePort, bind: Arc<dyn Bind>) -> Result<(), EngineError> {
        let settings = self.settings().ok_or(EngineError::NotConfigured)?;
        if self.is_running() {
            return Err(EngineError::Running);
        }
        let descriptor = settings.endpoint.as_deref().unwrap_or(DATACHANNEL_ENDPOINT);
        let endpoint = bind.parse_endpoint(descriptor)?;
        bind.open().await?;

        let tunn = Tunn::new(
            StaticSecret::from(settings.private_key),
            PublicKey::from(*settings.public_key.as_bytes()),
            None,
            settings.persistent_keepalive,
            rand::random::<u32>() >> 8,
            None,
        );
        let tunnel = Arc::new(Tunnel {
            tunn: Mutex::new(tunn),
            bind: Arc::clone(&bind),
            endpoint,
            settings,
        });

        if tunnel.settings.persistent_keepalive.is_some() {
            let mut buf = vec![0u8; BUFFER_LEN];
            if let Some(initiation) = tunnel.handshake_initiation(&mut buf) {
                tunnel.transmit(vec![initiation]).await;
            }
        }

        let InterfacePort { outbound, inbound } = port;
        let tasks = vec![
            tokio::spawn(network_loop(Arc::clone(&tunnel), inbound)),
            tokio::spawn(timer_loop(Arc::clone(&tunnel))),
            tokio::spawn(egress_loop(Arc::clone(&tunnel), outbound)),
        ];

        let mut running = self.running.lock();
        if running.is_some() {
            tasks.iter().for_each(JoinHandle::abort);
            return Err(EngineError::Running);
        }
        *running = Some(Running { bind, tasks });
        tracing::info!(
            target = "engine",
            peer = %tunnel.settings.public_key.short(),
            endpoint = %tunnel.endpoint,
            "tunnel engine up"
        );
        Ok(())
    }

    async fn down(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        for task in &running.tasks {
            task.abort();
        }
        running.bind.close().await;
        tracing::info!(target = "engine", "tunnel engine down");
    }
}

impl Drop for WireGuardEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.tasks.iter().for_each(JoinHandle::abort);
        }
    }
}

struct Tunnel {
    tunn: Mutex<Tunn>,
    bind: Arc<dyn Bind>,
    endpoint: Endpoint,
    settings: EngineSettings,
}

enum Decapsulated {
    Network(Vec<Bytes>),
    Tunnel(Bytes, IpAddr),
    Nothing,
}

impl Tunnel {
    async fn transmit(&self, datagrams: Vec<Bytes>) {
        for datagram in datagrams {
            if let Err(err) = self.bind.send(&self.endpoint, datagram).await {
                tracing::debug!(target = "engine", "datagram dropped: {err}");
            }
        }
    }

    fn handshake_initiation(&self, buf: &mut [u8]) -> Option<Bytes> {
        match self.tunn.lock().format_handshake_initiation(buf, false) {
            TunnResult::WriteToNetwork(datagram) => Some(Bytes::copy_from_slice(datagram)),
            _ => None,
        }
    }

    fn encapsulate(&self, packet: &[u8], buf: &mut [u8]) -> Option<Bytes> {
        match self.tunn.lock().encapsulate(packet, buf) {
            TunnResult::WriteToNetwork(datagram) => Some(Bytes::copy_from_slice(datagram)),
            TunnResult::Err(err) => {
                tracing::debug!(target = "engine", "encapsulate failed: {err:?}");
                None
            }
            _ => None,
        }
    }

    fn decapsulate(&self, datagram: &[u8], buf: &mut [u8]) -> Decapsulated {
        let mut tunn = self.tunn.lock();
        match tunn.decapsulate(None, datagram, buf) {
            TunnResult::WriteToNetwork(reply) => {
                let mut network = vec![Bytes::copy_from_slice(reply)];
                // Anything queued behind a completed handshake goes out now.
                while let TunnResult::WriteToNetwork(queued) = tunn.decapsulate(None, &[], buf) {
                    network.push(Bytes::copy_from_slice(queued));
                }
                Decapsulated::Network(network)
            }
            TunnResult::WriteToTunnelV4(packet, source) => {
                Decapsulated::Tunnel(Bytes::copy_from_slice(packet), IpAddr::V4(source))
            }
            TunnResult::WriteToTunnelV6(packet, source) => {
                Decapsulated::Tunnel(Bytes::copy_from_slice(packet), IpAddr::V6(source))
            }
            TunnResult::Err(err) => {
                tracing::trace!(target = "engine", "decapsulate failed: {err:?}");
                Decapsulated::Nothing
            }
            TunnResult::Done => Decapsulated::Nothing,
        }
    }

    fn update_timers(&self, buf: &mut [u8]) -> Option<Bytes> {
        match self.tunn.lock().update_timers(buf) {
            TunnResult::WriteToNetwork(datagram) => Some(Bytes::copy_from_slice(datagram)),
            TunnResult::Err(err) => {
                tracing::trace!(target = "engine", "timer: {err:?}");
                None
            }
            _ => None,
        }
    }
}

async fn network_loop(tunnel: Arc<Tunnel>, inbound: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; BUFFER_LEN];
    while let Some((from, datagram)) = tunnel.bind.recv().await {
        if from != tunnel.endpoint {
            tracing::trace!(target = "engine", %from, "datagram from unknown endpoint");
            continue;
        }
        match tunnel.decapsulate(&datagram, &mut buf) {
            Decapsulated::Network(replies) => tunnel.transmit(replies).await,
            Decapsulated::Tunnel(packet, source) => {
                if packet.is_empty() {
                    tracing::trace!(target = "engine", "keepalive");
                } else if !tunnel.settings.allows(source) {
                    tracing::debug!(target = "engine", %source, "inbound packet outside allowed ips");
                } else {
                    match inbound.try_send(packet) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::trace!(target = "engine", "interface backlog full, packet dropped");
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
            Decapsulated::Nothing => {}
        }
    }
    tracing::info!(target = "engine", "transport ended, tunnel receive loop stopped");
}

async fn timer_loop(tunnel: Arc<Tunnel>) {
    let mut buf = vec![0u8; BUFFER_LEN];
    let mut ticker = tokio::time::interval(TIMER_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Some(datagram) = tunnel.update_timers(&mut buf) {
            tunnel.transmit(vec![datagram]).await;
        }
    }
}

async fn egress_loop(tunnel: Arc<Tunnel>, mut outbound: mpsc::Receiver<Bytes>) {
    let mut buf = vec![0u8; BUFFER_LEN];
    while let Some(packet) = outbound.recv().await {
        match destination(&packet) {
            Some(dest) if tunnel.settings.allows(dest) => {
                if let Some(datagram) = tunnel.encapsulate(&packet, &mut buf) {
                    tunnel.transmit(vec![datagram]).await;
                }
            }
            Some(dest) => {
                tracing::debug!(target = "engine", %dest, "no allowed route, packet dropped");
            }
            None => {
                tracing::trace!(target = "engine", len = packet.len(), "not an ip packet");
            }
        }
    }
}

/// Destination address from a raw IPv4 or IPv6 header.
fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
