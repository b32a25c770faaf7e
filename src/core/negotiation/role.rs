//! Offerer/answerer role resolution.

use crate::core::config::MCU_AGENT;
use serde::{Deserialize, Serialize};

/// Name and major version a peer announces in `enter`/`welcome`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: u32,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// This crate, as it identifies itself to peers.
    pub fn local() -> Self {
        Self::new(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or_default(),
        )
    }

    pub fn is_mcu(&self) -> bool {
        self.name == MCU_AGENT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Offerer,
    Answerer,
    #[default]
    Undetermined,
}

/// Whether the local side may originate the offer to a given remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    /// Matched case-insensitively against the remote agent name.
    pub remote_agent: String,
    #[serde(default)]
    pub min_version: Option<u32>,
    #[serde(default)]
    pub max_version: Option<u32>,
    pub local_may_offer: bool,
}

impl CapabilityRule {
    pub fn matches(&self, remote: &AgentInfo) -> bool {
        self.remote_agent.eq_ignore_ascii_case(&remote.name)
            && self.min_version.map_or(true, |min| remote.version >= min)
            && self.max_version.map_or(true, |max| remote.version <= max)
    }
}

/// Ordered rules; the first matching rule decides, no match means the local
/// side may offer.
#[derive(Debug, Clone, Default)]
pub struct CapabilityMatrix {
    rules: Vec<CapabilityRule>,
}

impl CapabilityMatrix {
    pub fn new(rules: Vec<CapabilityRule>) -> Self {
        Self { rules }
    }

    pub fn may_offer(&self, remote: &AgentInfo) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matches(remote))
            .map_or(true, |rule| rule.local_may_offer)
    }

    /// A media server is always offered to, whatever the rules say.
    pub fn resolve(&self, remote: &AgentInfo) -> Role {
        if remote.is_mcu() || self.may_offer(remote) {
            Role::Offerer
        } else {
            Role::Answerer
        }
    }
}
