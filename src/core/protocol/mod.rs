//! Data-channel wire protocol: control messages and chunking.

pub mod chunk;
pub mod message;

pub use chunk::{chunk_count, ChunkAssembler, ChunkSet, Progress};
pub use message::{
    decode, Ack, CancelNotice, ChatMessage, ControlMessage, ErrorNotice, Inbound, WriteRequest,
};
