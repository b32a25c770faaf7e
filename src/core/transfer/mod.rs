//! Chunked transfer protocol.
//!
//! ```text
//! sender                               receiver
//!   │── WRQ{size, chunkSize, chunkCount} ─▶│  uploadRequest
//!   │◀──────────── ACK(0) | ACK(-1) ───────│  respond_request
//!   │── chunk[0] ─────────────────────────▶│
//!   │◀──────────── ACK(1) ─────────────────│
//!   │                ...                   │
//!   │── chunk[C-1] ───────────────────────▶│  downloadCompleted
//!   │◀──────────── ACK(C) ─────────────────│
//!   uploadCompleted
//! ```
//!
//! Either side may send CANCEL at any point, and a side whose timeout
//! expires sends ERROR before tearing down.

pub mod coordinator;
pub mod session;
pub mod timeout;

pub use coordinator::{DataInfo, TransferCoordinator};
pub use session::{SessionState, TransferSession};
pub use timeout::TimeoutSupervisor;
