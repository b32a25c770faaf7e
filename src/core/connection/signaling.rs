//! Messages exchanged through the signaling rendezvous during the handshake.
//!
//! Never sent on the data channel.

use super::IceCandidate;
use crate::core::negotiation::role::AgentInfo;
use crate::core::peer::PeerId;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// Announce presence in the room; the receiver replies with `Welcome`.
    Enter { agent: AgentInfo },
    /// Reply to `Enter`. A negative weight is a role handoff: the receiver
    /// is asked to create the offer.
    Welcome { agent: AgentInfo, weight: i32 },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enter { .. } => "enter",
            Self::Welcome { .. } => "welcome",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    pub room_id: String,
    pub sender: PeerId,
    /// `None` addresses everyone in the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    pub message: SignalingMessage,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()>;
}

#[async_trait]
impl SignalingChannel for mpsc::UnboundedSender<SignalingEnvelope> {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        mpsc::UnboundedSender::send(self, envelope)
            .map_err(|_| anyhow!("Signaling channel closed"))
    }
}
