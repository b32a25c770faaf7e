//! In-process data channel pair.
//!
//! Each end sends into the other end's inbound queue. Used by the loopback
//! demo and the integration tests in place of a real peer connection.

use super::{ChannelPayload, DataChannel};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct MemoryChannel {
    label: String,
    tx: mpsc::UnboundedSender<ChannelPayload>,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Refuse further sends, as a closed transport would.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, payload: ChannelPayload) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("Channel '{}' is closed", self.label));
        }
        self.tx
            .send(payload)
            .map_err(|_| anyhow!("Channel '{}' peer is gone", self.label))
    }
}

/// One side of a linked pair: the channel to send on and the queue of
/// frames the other side sent.
pub struct MemoryEnd {
    pub channel: Arc<MemoryChannel>,
    pub inbound: mpsc::UnboundedReceiver<ChannelPayload>,
}

/// Create two linked ends. Frames sent on `a.channel` arrive on
/// `b.inbound` in order, and vice versa.
pub fn pair(label: &str) -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let end = |tx, rx| MemoryEnd {
        channel: Arc::new(MemoryChannel {
            label: label.to_string(),
            tx,
            closed: AtomicBool::new(false),
        }),
        inbound: rx,
    };
    (end(a_tx, a_rx), end(b_tx, b_rx))
}
