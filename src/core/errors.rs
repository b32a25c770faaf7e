//! Error kinds surfaced by the transfer coordinator and the negotiator.
//!
//! Protocol faults are not returned up the stack as panics: the coordinator
//! turns them into [`crate::core::events::TransferEvent::Failed`] events and
//! the negotiator into `handshakeProgress` errors. The enums are `Clone` so
//! they can ride along inside events.

use crate::core::peer::{Direction, PeerId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("connection timeout, no reply within {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("chunk size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("no open data channel to peer {0}")]
    UnroutablePeer(PeerId),

    #[error("no open data channels to send to")]
    NoOpenChannels,

    #[error("a {direction} transfer with peer {peer_id} is already in progress")]
    SessionBusy { peer_id: PeerId, direction: Direction },

    #[error("no {direction} transfer with peer {peer_id}")]
    UnknownSession { peer_id: PeerId, direction: Direction },

    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    #[error("peer reported: {0}")]
    Remote(String),

    #[error("superseded by a new request from the peer")]
    Superseded,

    #[error("data channel closed")]
    ChannelClosed,

    #[error("data channel send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("failed to create peer connection: {0}")]
    PeerConnection(String),

    #[error("failed to create offer: {0}")]
    CreateOffer(String),

    #[error("failed to create answer: {0}")]
    CreateAnswer(String),

    #[error("failed to set local description: {0}")]
    SetLocalDescription(String),

    #[error("failed to set remote description: {0}")]
    SetRemoteDescription(String),

    #[error("failed to add ICE candidate: {0}")]
    AddCandidate(String),

    #[error("ICE gathering failed: {0}")]
    IceGathering(String),

    #[error("signaling send failed: {0}")]
    Signaling(String),

    #[error("no peer connection for {0}")]
    UnknownPeer(PeerId),
}
