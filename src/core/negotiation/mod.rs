//! Session negotiation: role resolution, SDP rewriting, and the handshake
//! driven over the signaling collaborator.

pub mod negotiator;
pub mod role;
pub mod sdp;

pub use negotiator::{NegotiationState, Negotiator, PeerConnectionFactory};
pub use role::{AgentInfo, CapabilityMatrix, CapabilityRule, Role};
