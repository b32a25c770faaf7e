//! meshdrop: peer-to-peer session negotiation and chunked payload transfer.
//!
//! Two subsystems live under [`core`]:
//!
//! - [`core::negotiation`] decides offer/answer roles, rewrites session
//!   descriptions and drives the handshake through a signaling collaborator.
//! - [`core::transfer`] runs the WRQ/ACK/ERROR/CANCEL state machine, one
//!   session per (peer, direction), with a receiver-paced window of one chunk
//!   and a per-session timeout supervisor.
//!
//! The peer-connection primitive, the data channel and the signaling
//! transport are consumed through traits in [`core::connection`]; adapters
//! for the `webrtc` crate and an in-memory channel pair are provided.

pub mod core;
pub mod workers;
