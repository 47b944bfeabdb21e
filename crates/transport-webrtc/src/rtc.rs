use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::{
    NegotiationError, NegotiationRole, PeerEvent, PeerFactory, PeerHandle, RtcPeer, WebRtcConfig,
};

/// Builds peer connections on the `webrtc` crate.
pub struct WebRtcPeerFactory {
    config: WebRtcConfig,
}

impl WebRtcPeerFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create_peer(&self, role: NegotiationRole) -> Result<PeerHandle, NegotiationError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        let candidate_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate
                    .to_json()
                    .map_err(|err| err.to_string())
                    .and_then(|init| serde_json::to_vec(&init).map_err(|err| err.to_string()))
                {
                    Ok(raw) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(Bytes::from(raw)));
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", "failed to encode local candidate: {err}");
                    }
                }
            })
        }));

        let state_tx = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Failed => {
                            let _ = tx.send(PeerEvent::ConnectionFailed(
                                "ice connectivity failed".into(),
                            ));
                        }
                        RTCPeerConnectionState::Closed => {
                            let _ = tx.send(PeerEvent::ChannelClosed);
                        }
                        _ => {}
                    }
                })
            },
        ));

        match role {
            NegotiationRole::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(self.config.ordered),
                    max_retransmits: self.config.max_retransmits,
                    ..Default::default()
                };
                let data_channel = peer_connection
                    .create_data_channel(&self.config.data_channel_label, Some(init))
                    .await?;
                wire_data_channel(&data_channel, events_tx.clone());
                *channel.write() = Some(data_channel);
            }
            NegotiationRole::Responder => {
                let slot = Arc::clone(&channel);
                let channel_tx = events_tx.clone();
                peer_connection.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot);
                    let tx = channel_tx.clone();
                    Box::pin(async move {
                        tracing::debug!(
                            target = "webrtc",
                            label = %data_channel.label(),
                            "remote data channel announced"
                        );
                        wire_data_channel(&data_channel, tx);
                        *slot.write() = Some(data_channel);
                    })
                }));
            }
        }

        Ok(PeerHandle {
            peer: Arc::new(WebRtcPeer {
                peer_connection,
                channel,
                closed: AtomicBool::new(false),
            }),
            events: events_rx,
        })
    }
}

fn wire_data_channel(data_channel: &Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<PeerEvent>) {
    let open_tx = tx.clone();
    data_channel.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel open");
            let _ = open_tx.send(PeerEvent::ChannelOpen);
        })
    }));

    let close_tx = tx.clone();
    data_channel.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel closed");
            let _ = tx.send(PeerEvent::ChannelClosed);
        })
    }));

    data_channel.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::Message(message.data));
        })
    }));
}

struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    closed: AtomicBool,
}

fn sdp_text(raw: Bytes) -> Result<String, NegotiationError> {
    String::from_utf8(raw.to_vec())
        .map_err(|err| NegotiationError::InvalidDescription(err.to_string()))
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> Result<Bytes, NegotiationError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(Bytes::from(offer.sdp))
    }

    async fn accept_offer(&self, offer: Bytes) -> Result<Bytes, NegotiationError> {
        let offer = RTCSessionDescription::offer(sdp_text(offer)?)
            .map_err(|err| NegotiationError::InvalidDescription(err.to_string()))?;
        self.peer_connection.set_remote_description(offer).await?;
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(Bytes::from(answer.sdp))
    }

    async fn apply_answer(&self, answer: Bytes) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(sdp_text(answer)?)
            .map_err(|err| NegotiationError::InvalidDescription(err.to_string()))?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Bytes) -> Result<(), NegotiationError> {
        let init: RTCIceCandidateInit = serde_json::from_slice(&candidate)
            .map_err(|err| NegotiationError::InvalidCandidate(err.to_string()))?;
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), NegotiationError> {
        let data_channel = self
            .channel
            .read()
            .clone()
            .ok_or(NegotiationError::ChannelUnavailable)?;
        data_channel.send(&message).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let data_channel = self.channel.write().take();
        if let Some(data_channel) = data_channel {
            if let Err(err) = data_channel.close().await {
                tracing::debug!(target = "webrtc", "data channel close failed: {err}");
            }
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "webrtc", "peer connection close failed: {err}");
        }
    }
}
