//! Collaborator interfaces the negotiator and coordinator are written against.
//!
//! The peer-connection primitive, the data channel and the signaling
//! transport are not owned here. They are consumed through the traits below;
//! [`webrtc`] adapts the `webrtc` crate and [`memory`] provides an in-process
//! channel pair.

pub mod memory;
pub mod signaling;
pub mod webrtc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use signaling::{SignalingChannel, SignalingEnvelope, SignalingMessage};

// ── Data channel ─────────────────────────────────────────────────────────────

/// One frame on a data channel: text (control messages, base64 chunks) or
/// binary (raw chunks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, payload: ChannelPayload) -> Result<()>;
}

// ── Peer connection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Serializes the same way a browser's `RTCSessionDescriptionInit` does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// The offer/answer/ICE primitive a [`crate::core::negotiation::Negotiator`]
/// drives for one remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Wait until ICE gathering has finished and return the local
    /// description with every gathered candidate embedded.
    async fn gathering_complete(&self) -> Result<SessionDescription>;

    /// Locally discovered candidates, for trickle ICE. Yields `None` after
    /// the first call.
    fn take_local_candidates(&self) -> Option<mpsc::Receiver<IceCandidate>>;
}
