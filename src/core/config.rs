//! Centralized configuration for meshdrop.
//!
//! Tunable constants live at the top; the serde-backed settings structs
//! below are what the binary loads from TOML and what the coordinator and
//! negotiator are constructed with.

use crate::core::negotiation::role::{AgentInfo, CapabilityRule};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (48 KB).
///
/// Fits inside the 64 KB SCTP message limit that most data-channel stacks
/// accept by default, even after base64 expansion (64 KB * 3/4 = 48 KB).
pub const CHUNK_SIZE: usize = 48 * 1024;

/// Seconds to wait for the peer's next reply before abandoning a transfer.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Upper bound accepted for a peer-declared timeout (one hour).
pub const MAX_TIMEOUT_SECS: u64 = 3600;

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Timeout for ICE candidate gathering when trickle is disabled.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Buffer depth for locally discovered ICE candidates awaiting signaling.
pub const CANDIDATE_QUEUE_DEPTH: usize = 64;

/// Agent name of a media server; the local side always offers to it.
pub const MCU_AGENT: &str = "MCU";

/// Room used when none is configured.
pub const DEFAULT_ROOM: &str = "default";

// ── Settings ─────────────────────────────────────────────────────────────────

/// How chunks are framed on the data channel.
///
/// `Binary` sends raw bytes and sizes are counted directly. `Base64` sends
/// text frames for transports that are not binary-safe; the receiver decodes
/// before counting, so declared sizes are always raw byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkEncoding {
    #[default]
    Binary,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub timeout_secs: u64,
    pub encoding: ChunkEncoding,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            encoding: ChunkEncoding::Binary,
        }
    }
}

/// Per-media bandwidth caps in kbps, written as `b=AS` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Bandwidth {
    pub audio: Option<u32>,
    pub video: Option<u32>,
    pub data: Option<u32>,
}

impl Bandwidth {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none() && self.data.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorSettings {
    pub room_id: String,
    /// Send descriptions immediately and forward candidates as they appear.
    pub ice_trickle: bool,
    pub stereo: bool,
    pub bandwidth: Bandwidth,
    pub local_agent: AgentInfo,
    pub capability_rules: Vec<CapabilityRule>,
}

impl Default for NegotiatorSettings {
    fn default() -> Self {
        Self {
            room_id: DEFAULT_ROOM.to_string(),
            ice_trickle: true,
            stereo: false,
            bandwidth: Bandwidth::default(),
            local_agent: AgentInfo::local(),
            capability_rules: Vec::new(),
        }
    }
}

/// Top-level settings file layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transfer: TransferSettings,
    pub negotiator: NegotiatorSettings,
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid settings file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}
