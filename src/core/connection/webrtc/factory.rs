use super::{attach_data_channel, WebRtcPeerConnection};
use crate::core::connection::PeerConnection;
use crate::core::negotiation::PeerConnectionFactory;
use crate::core::peer::PeerId;
use crate::core::transfer::TransferCoordinator;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Label of the data channel transfers run on.
pub const DATA_CHANNEL_LABEL: &str = "data";
/// SCTP stream id both sides use for [`DATA_CHANNEL_LABEL`].
pub const DATA_CHANNEL_ID: u16 = 0;

/// Builds one `RTCPeerConnection` per remote peer with the negotiated
/// `data` channel already attached to `coordinator`.
pub struct WebRtcPeerFactory {
    coordinator: TransferCoordinator,
    ice_servers: Option<Vec<RTCIceServer>>,
}

impl WebRtcPeerFactory {
    pub fn new(coordinator: TransferCoordinator) -> Self {
        Self {
            coordinator,
            ice_servers: None,
        }
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<RTCIceServer>) -> Self {
        self.ice_servers = Some(ice_servers);
        self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(&self, peer_id: &PeerId) -> Result<Arc<dyn PeerConnection>> {
        let pc = match &self.ice_servers {
            Some(servers) => WebRtcPeerConnection::with_ice_servers(servers.clone()).await?,
            None => WebRtcPeerConnection::new().await?,
        };

        let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, DATA_CHANNEL_ID).await?;
        attach_data_channel(&self.coordinator, peer_id.clone(), &dc).await;

        Ok(Arc::new(pc))
    }
}
