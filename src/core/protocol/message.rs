//! Wire messages on the data channel.
//!
//! Control messages are JSON text frames with a `type` discriminator. Any
//! frame that does not parse as a control envelope is a raw chunk: binary
//! frames directly, text frames as base64.

use crate::core::config::MAX_TIMEOUT_SECS;
use crate::core::connection::ChannelPayload;
use crate::core::errors::TransferError;
use crate::core::peer::PeerId;
use crate::core::protocol::chunk::chunk_count;
use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Control messages ─────────────────────────────────────────────────────────

/// Write request: the sender asks the receiver to accept a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub name: String,
    /// Total payload size in raw bytes.
    pub size: u64,
    pub chunk_size: usize,
    pub chunk_count: u64,
    /// Seconds either side waits for the next reply.
    pub timeout: u64,
    pub sender: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl WriteRequest {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.size > 0 && self.chunk_size == 0 {
            return Err(TransferError::InvalidRequest("chunkSize must be positive".into()));
        }
        let expected = chunk_count(self.size, self.chunk_size);
        if self.chunk_count != expected {
            return Err(TransferError::InvalidRequest(format!(
                "chunkCount {} does not match size {} at chunkSize {} (expected {expected})",
                self.chunk_count, self.size, self.chunk_size
            )));
        }
        if self.timeout == 0 || self.timeout > MAX_TIMEOUT_SECS {
            return Err(TransferError::InvalidRequest(format!(
                "timeout {} outside 1..={MAX_TIMEOUT_SECS}",
                self.timeout
            )));
        }
        Ok(())
    }
}

/// `-1` rejects, `0` accepts and pulls the first chunk, `n` pulls chunk `n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "ackN")]
    pub ack_n: i64,
    pub sender: PeerId,
}

impl Ack {
    pub const REJECT: i64 = -1;

    pub fn is_reject(&self) -> bool {
        self.ack_n == Self::REJECT
    }
}

/// Abort notice. `is_upload_error` is set when the failing side was the
/// uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub name: String,
    pub content: String,
    pub is_upload_error: bool,
    pub sender: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelNotice {
    pub name: String,
    pub content: String,
    pub sender: PeerId,
    pub is_upload_error: bool,
}

/// Peer-to-peer message outside the transfer state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
    pub data: Value,
    pub is_private: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "WRQ")]
    Wrq(WriteRequest),
    #[serde(rename = "ACK")]
    Ack(Ack),
    #[serde(rename = "ERROR")]
    Error(ErrorNotice),
    #[serde(rename = "CANCEL")]
    Cancel(CancelNotice),
    #[serde(rename = "MESSAGE")]
    Message(ChatMessage),
}

const KNOWN_TYPES: [&str; 5] = ["WRQ", "ACK", "ERROR", "CANCEL", "MESSAGE"];

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Wrq(_) => "WRQ",
            Self::Ack(_) => "ACK",
            Self::Error(_) => "ERROR",
            Self::Cancel(_) => "CANCEL",
            Self::Message(_) => "MESSAGE",
        }
    }

    pub fn to_payload(&self) -> Result<ChannelPayload> {
        Ok(ChannelPayload::Text(serde_json::to_string(self)?))
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlMessage),
    /// Raw chunk bytes from a binary frame.
    Chunk(Bytes),
    /// Base64 chunk from a text frame, still encoded.
    TextChunk(String),
    /// An envelope with a `type` this side cannot handle, or a known
    /// `type` with missing or mistyped fields.
    Unsupported { kind: String, reason: String },
}

pub fn decode(payload: ChannelPayload) -> Inbound {
    let text = match payload {
        ChannelPayload::Binary(data) => return Inbound::Chunk(data),
        ChannelPayload::Text(text) => text,
    };

    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => return Inbound::TextChunk(text),
    };
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Inbound::TextChunk(text),
    };

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Inbound::Unsupported {
            kind,
            reason: "unknown message type".into(),
        };
    }
    match serde_json::from_value::<ControlMessage>(value) {
        Ok(msg) => Inbound::Control(msg),
        Err(e) => Inbound::Unsupported {
            kind,
            reason: e.to_string(),
        },
    }
}
