use std::sync::Arc;

use transport_signaling::{ConnectError, PeerIdentity, SignalingSession};
use transport_webrtc::{
    Bind, ChannelState, DATACHANNEL_ENDPOINT, DataChannelBind, PeerFactory, SignalRouter,
    WebRtcPeerFactory,
};

use crate::config::TunnelConfig;
use crate::engine::{EngineSettings, InterfacePort, TunnelEngine, TunnelInterface, WireGuardEngine};
use crate::error::{BootstrapError, ConfigError};
use crate::probe::{self, EchoResponder, ProbeReport};
use crate::role::TunnelRole;

/// Joins the relay named in `config` and brings up a WireGuard tunnel over
/// a WebRTC data channel.
pub async fn bootstrap(config: TunnelConfig) -> Result<RunningTunnel, BootstrapError> {
    config.validate()?;
    let signaling = SignalingSession::connect_with_config(
        &config.signal_endpoint,
        config.key_pair.public(),
        config.signaling.clone(),
    )
    .await
    .map_err(|err| match err {
        err @ ConnectError::InvalidEndpoint { .. } => ConfigError::InvalidEndpoint(err).into(),
        err @ ConnectError::InvalidConfig { .. } => ConfigError::InvalidSignaling(err).into(),
        err => BootstrapError::RelayUnreachable(err),
    })?;
    let factory: Arc<dyn PeerFactory> = Arc::new(WebRtcPeerFactory::new(config.rtc.clone()));
    bootstrap_with(config, signaling, factory, Arc::new(WireGuardEngine::new())).await
}

/// Brings up a tunnel over an already joined relay session, with the given
/// channel factory and engine.
///
/// Initiators return once the channel is open and an echo probe has been
/// answered. Responders return as soon as the engine is up and waiting.
pub async fn bootstrap_with(
    config: TunnelConfig,
    signaling: Arc<SignalingSession>,
    factory: Arc<dyn PeerFactory>,
    engine: Arc<dyn TunnelEngine>,
) -> Result<RunningTunnel, BootstrapError> {
    config.validate()?;
    let local = config.key_pair.public();
    if signaling.local_identity() != local {
        return Err(ConfigError::InvalidKey {
            field: "key",
            reason: format!(
                "relay session belongs to {} but the local key is {local}",
                signaling.local_identity()
            ),
        }
        .into());
    }
    tracing::info!(
        target = "bootstrap",
        role = %config.role,
        local = %local.short(),
        remote = %config.remote.short(),
        ip = %config.local_addr,
        remote_ip = %config.remote_addr,
        "starting tunnel"
    );

    let router = SignalRouter::new(Arc::clone(&signaling));
    let bind = Arc::new(DataChannelBind::new(
        Arc::clone(&router),
        factory,
        config.remote,
        config.role.negotiation_role(),
        config.rtc.clone(),
    ));
    let (interface, port) = TunnelInterface::new(config.local_addr, config.interface_capacity);
    let mut tunnel = RunningTunnel {
        role: config.role,
        remote: config.remote,
        interface,
        bind,
        engine,
        router,
        signaling,
        responder: None,
        probe: None,
    };

    if let Err(err) = tunnel.start(&config, port).await {
        tracing::warn!(target = "bootstrap", "bootstrap failed: {err}");
        tunnel.shutdown().await;
        return Err(err);
    }
    Ok(tunnel)
}

/// A tunnel that came up. Dropping it tears the channel down; prefer
/// [`RunningTunnel::shutdown`] to also leave the relay.
pub struct RunningTunnel {
    role: TunnelRole,
    remote: PeerIdentity,
    interface: Arc<TunnelInterface>,
    bind: Arc<DataChannelBind>,
    engine: Arc<dyn TunnelEngine>,
    router: Arc<SignalRouter>,
    signaling: Arc<SignalingSession>,
    responder: Option<EchoResponder>,
    probe: Option<ProbeReport>,
}

impl RunningTunnel {
    async fn start(&mut self, config: &TunnelConfig, port: InterfacePort) -> Result<(), BootstrapError> {
        let settings = EngineSettings {
            private_key: config.key_pair.private_bytes(),
            public_key: config.remote,
            persistent_keepalive: config.keepalive,
            endpoint: Some(DATACHANNEL_ENDPOINT.to_string()),
            allowed_ips: vec![config.role.allowed_traffic(config.remote_addr)],
        };
        self.engine.ipc_set(&settings.to_uapi())?;
        let transport: Arc<dyn Bind> = self.bind.clone();
        self.engine.up(port, transport).await?;

        if self.role == TunnelRole::Initiator {
            self.bind
                .wait_open()
                .await
                .map_err(|state| BootstrapError::from_terminal(state, self.remote))?;
            let report =
                probe::verify(&self.interface, config.remote_addr, config.probe_timeout).await?;
            tracing::info!(
                target = "bootstrap",
                remote_ip = %report.remote,
                rtt = ?report.rtt,
                attempts = report.attempts,
                "tunnel verified"
            );
            self.probe = Some(report);
        } else {
            tracing::info!(target = "bootstrap", "waiting for the initiator");
        }
        self.responder = Some(EchoResponder::spawn(Arc::clone(&self.interface)));
        Ok(())
    }

    pub fn role(&self) -> TunnelRole {
        self.role
    }

    pub fn remote(&self) -> PeerIdentity {
        self.remote
    }

    pub fn interface(&self) -> &Arc<TunnelInterface> {
        &self.interface
    }

    /// The initiator's verification result.
    pub fn probe_report(&self) -> Option<&ProbeReport> {
        self.probe.as_ref()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.bind.state()
    }

    /// Resolves when the data channel ends. `Ok` only for a deliberate
    /// close.
    pub async fn wait_terminated(&self) -> Result<(), BootstrapError> {
        match self.bind.wait_terminated().await {
            ChannelState::Closed => Ok(()),
            state => Err(BootstrapError::from_terminal(state, self.remote)),
        }
    }

    /// Stops the engine, closes the channel and leaves the relay.
    pub async fn shutdown(mut self) {
        self.responder.take();
        self.engine.down().await;
        self.bind.close().await;
        self.router.close();
        self.signaling.close();
        tracing::info!(target = "bootstrap", remote = %self.remote.short(), "tunnel shut down");
    }
}
