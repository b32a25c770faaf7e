use crate::core::config::CANDIDATE_QUEUE_DEPTH;
use crate::core::connection::{IceCandidate, PeerConnection, SdpType, SessionDescription};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// `RTCPeerConnection` wrapper.
///
/// Local candidates are forwarded into a queue the owner takes once; ICE
/// gathering state is tracked in a watch so
/// [`PeerConnection::gathering_complete`] can be awaited at any time.
pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    candidates_rx: Mutex<Option<mpsc::Receiver<IceCandidate>>>,
    gathering_rx: watch::Receiver<RTCIceGathererState>,
}

impl WebRtcPeerConnection {
    pub async fn new() -> Result<Self> {
        Self::with_ice_servers(vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_owned()],
            ..Default::default()
        }])
        .await
    }

    pub async fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .context("Failed to create peer connection")?,
        );

        let (candidates_tx, candidates_rx) = mpsc::channel(CANDIDATE_QUEUE_DEPTH);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidates_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        if tx.send(candidate).await.is_err() {
                            warn!(event = "ice_candidate_dropped", "Local candidate receiver dropped");
                        }
                    }
                    Err(e) => {
                        warn!(event = "ice_candidate_invalid", error = %e, "Cannot serialize local candidate");
                    }
                }
            })
        }));

        let (gathering_tx, gathering_rx) = watch::channel(RTCIceGathererState::New);
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let _ = gathering_tx.send(state);
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", "WebRTC connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", "WebRTC transient disconnect (ICE may recover)");
                    }
                    RTCPeerConnectionState::Closed => {
                        info!(event = "webrtc_closed", "WebRTC connection closed");
                    }
                    _ => {}
                }
            })
        }));

        // Transfers only run on the pre-negotiated channel; in-band
        // announcements from the remote are not attached.
        pc.on_data_channel(Box::new(move |dc| {
            Box::pin(async move {
                warn!(event = "dc_unexpected", channel = %dc.label(), id = dc.id(), "Ignoring remotely announced data channel");
            })
        }));

        Ok(Self {
            pc,
            candidates_rx: Mutex::new(Some(candidates_rx)),
            gathering_rx,
        })
    }

    /// Open an ordered, reliable data channel with a fixed stream `id`.
    ///
    /// The channel is negotiated out of band: both sides create it with the
    /// same `id` and neither announces it, so each side ends up with exactly
    /// one channel per label.
    pub async fn create_data_channel(&self, label: &str, id: u16) -> Result<Arc<RTCDataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(id),
            ..Default::default()
        };
        self.pc
            .create_data_channel(label, Some(init))
            .await
            .with_context(|| format!("Failed to create data channel '{label}'"))
    }

    pub async fn close(&self) -> Result<()> {
        self.pc.close().await.context("Failed to close peer connection")
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
        let desc = match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        desc.context("Invalid session description")
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(Into::into)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(Into::into)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(Into::into)
    }

    async fn gathering_complete(&self) -> Result<SessionDescription> {
        if self.pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            let mut rx = self.gathering_rx.clone();
            while *rx.borrow_and_update() != RTCIceGathererState::Complete {
                rx.changed()
                    .await
                    .map_err(|_| anyhow!("ICE gathering state channel closed"))?;
            }
        }

        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| anyhow!("No local description after ICE gathering"))?;
        let kind = if desc.sdp_type == RTCSdpType::Answer {
            SdpType::Answer
        } else {
            SdpType::Offer
        };
        Ok(SessionDescription { kind, sdp: desc.sdp })
    }

    fn take_local_candidates(&self) -> Option<mpsc::Receiver<IceCandidate>> {
        self.candidates_rx.lock().ok()?.take()
    }
}
