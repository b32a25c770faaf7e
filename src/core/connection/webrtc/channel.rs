use crate::core::connection::{ChannelPayload, DataChannel};
use crate::core::peer::PeerId;
use crate::core::transfer::TransferCoordinator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    pub fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    async fn send(&self, payload: ChannelPayload) -> Result<()> {
        let label = self.inner.label();
        match payload {
            ChannelPayload::Text(text) => self
                .inner
                .send_text(text)
                .await
                .with_context(|| format!("Failed to send text on '{label}'"))?,
            ChannelPayload::Binary(data) => self
                .inner
                .send(&data)
                .await
                .with_context(|| format!("Failed to send binary on '{label}'"))?,
        };
        Ok(())
    }
}

fn to_payload(msg: DataChannelMessage) -> ChannelPayload {
    if msg.is_string {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => ChannelPayload::Text(text),
            Err(e) => ChannelPayload::Binary(Bytes::from(e.into_bytes())),
        }
    } else {
        ChannelPayload::Binary(msg.data)
    }
}

/// Attach `on_open`, `on_close`, `on_error`, and `on_message` callbacks to
/// `dc` so that it carries transfers for `peer_id`.
///
/// The channel is registered with the coordinator once open, inbound frames
/// are fed through the coordinator's per-channel pump in arrival order, and
/// closing the channel tears down that peer's sessions.
pub async fn attach_data_channel(
    coordinator: &TransferCoordinator,
    peer_id: PeerId,
    dc: &Arc<RTCDataChannel>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    coordinator.spawn_pump(peer_id.clone(), rx);
    let channel: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel::new(dc.clone()));

    let (coord, peer, registered, label) = (
        coordinator.clone(),
        peer_id.clone(),
        channel.clone(),
        dc.label().to_string(),
    );
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            debug!(event = "dc_open", peer = %peer, channel = %label, "DataChannel open");
            coord.register_channel(peer, registered).await;
        })
    }));
    if dc.ready_state() == RTCDataChannelState::Open {
        coordinator.register_channel(peer_id.clone(), channel.clone()).await;
    }

    let (coord, peer, label) = (coordinator.clone(), peer_id.clone(), dc.label().to_string());
    dc.on_close(Box::new(move || {
        let (coord, peer, label, channel) = (coord.clone(), peer.clone(), label.clone(), channel.clone());
        Box::pin(async move {
            warn!(event = "dc_closed", peer = %peer, channel = %label, "DataChannel closed by transport");
            coord.unregister_channel_if(&peer, &channel).await;
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        let label = label.clone();
        Box::pin(async move {
            error!(event = "dc_error", channel = %label, %err, "DataChannel transport error");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(to_payload(msg));
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_messages_become_text_frames() {
        let msg = DataChannelMessage {
            is_string: true,
            data: Bytes::from_static(b"{\"type\":\"ACK\"}"),
        };
        assert_eq!(to_payload(msg), ChannelPayload::Text("{\"type\":\"ACK\"}".into()));
    }

    #[test]
    fn binary_messages_stay_binary() {
        let msg = DataChannelMessage {
            is_string: false,
            data: Bytes::from_static(&[0, 159, 146, 150]),
        };
        assert_eq!(to_payload(msg), ChannelPayload::Binary(Bytes::from_static(&[0, 159, 146, 150])));
    }
}
