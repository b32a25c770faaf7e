//! Adapters from the `webrtc` crate to the collaborator traits.
//!
//! - [`WebRtcPeerConnection`] implements [`super::PeerConnection`].
//! - [`WebRtcDataChannel`] implements [`super::DataChannel`], and
//!   [`attach_data_channel`] wires an `RTCDataChannel` into a
//!   [`crate::core::transfer::TransferCoordinator`].
//! - [`WebRtcPeerFactory`] plugs both into a
//!   [`crate::core::negotiation::Negotiator`].

mod channel;
mod factory;
mod peer;

pub use channel::{attach_data_channel, WebRtcDataChannel};
pub use factory::{WebRtcPeerFactory, DATA_CHANNEL_LABEL};
pub use peer::WebRtcPeerConnection;
