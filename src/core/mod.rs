pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod transfer;

pub use errors::{NegotiationError, TransferError};
pub use events::{Event, EventBus, EventKind, EventSink, Propagation};
pub use peer::{Direction, PeerId, SessionKey};
