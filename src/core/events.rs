//! App-facing events and the in-process bus that fans them out.
//!
//! Three named event kinds exist: `dataTransferState`, `incomingMessage` and
//! `handshakeProgress`. Delivery is synchronous and ordered: persistent
//! subscribers first, then one-shot subscribers, each group in registration
//! order. A subscriber may return [`Propagation::Stop`] to halt delivery to
//! everything after it.

use crate::core::errors::{NegotiationError, TransferError};
use crate::core::peer::{Direction, PeerId};
use bytes::Bytes;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

// ── Event payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataTransferState,
    IncomingMessage,
    HandshakeProgress,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataTransferState => "dataTransferState",
            Self::IncomingMessage => "incomingMessage",
            Self::HandshakeProgress => "handshakeProgress",
        }
    }
}

/// Transfer lifecycle notifications, keyed by `(transfer_id, peer_id)`.
///
/// A broadcast shares one `transfer_id` across all of its per-peer sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The remote wants to upload to us; answer with `respond_request`.
    UploadRequest {
        transfer_id: Uuid,
        peer_id: PeerId,
        name: String,
        size: u64,
        chunk_size: usize,
        chunk_count: u64,
        timeout_secs: u64,
        agent: Option<String>,
    },
    /// Emitted once per logical upload, listing every peer it was sent to.
    UploadStarted {
        transfer_id: Uuid,
        peer_ids: Vec<PeerId>,
        name: String,
        size: u64,
    },
    DownloadStarted {
        transfer_id: Uuid,
        peer_id: PeerId,
        name: String,
        size: u64,
    },
    Uploading {
        transfer_id: Uuid,
        peer_id: PeerId,
        percentage: u8,
    },
    Downloading {
        transfer_id: Uuid,
        peer_id: PeerId,
        percentage: u8,
    },
    UploadCompleted {
        transfer_id: Uuid,
        peer_id: PeerId,
        name: String,
    },
    DownloadCompleted {
        transfer_id: Uuid,
        peer_id: PeerId,
        name: String,
        data: Bytes,
    },
    /// The request was declined. `direction` is the local side's view.
    Rejected {
        transfer_id: Uuid,
        peer_id: PeerId,
        direction: Direction,
        name: String,
    },
    Cancelled {
        transfer_id: Uuid,
        peer_id: PeerId,
        direction: Direction,
        name: String,
        message: String,
        cancelled_by: PeerId,
    },
    Failed {
        transfer_id: Uuid,
        peer_id: PeerId,
        direction: Direction,
        error: TransferError,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> Uuid {
        match self {
            Self::UploadRequest { transfer_id, .. }
            | Self::UploadStarted { transfer_id, .. }
            | Self::DownloadStarted { transfer_id, .. }
            | Self::Uploading { transfer_id, .. }
            | Self::Downloading { transfer_id, .. }
            | Self::UploadCompleted { transfer_id, .. }
            | Self::DownloadCompleted { transfer_id, .. }
            | Self::Rejected { transfer_id, .. }
            | Self::Cancelled { transfer_id, .. }
            | Self::Failed { transfer_id, .. } => *transfer_id,
        }
    }

    /// `None` for [`TransferEvent::UploadStarted`], which spans several peers.
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::UploadStarted { .. } => None,
            Self::UploadRequest { peer_id, .. }
            | Self::DownloadStarted { peer_id, .. }
            | Self::Uploading { peer_id, .. }
            | Self::Downloading { peer_id, .. }
            | Self::UploadCompleted { peer_id, .. }
            | Self::DownloadCompleted { peer_id, .. }
            | Self::Rejected { peer_id, .. }
            | Self::Cancelled { peer_id, .. }
            | Self::Failed { peer_id, .. } => Some(peer_id),
        }
    }

    /// True for states after which the session no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::UploadCompleted { .. }
                | Self::DownloadCompleted { .. }
                | Self::Rejected { .. }
                | Self::Cancelled { .. }
                | Self::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub content: Value,
    pub is_private: bool,
    pub target_peer_id: Option<PeerId>,
    pub sender_peer_id: PeerId,
    /// Local echo of a message this side sent.
    pub is_self: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Enter,
    Welcome,
    Offer,
    Answer,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeProgress {
    pub peer_id: PeerId,
    pub step: HandshakeStep,
    pub error: Option<NegotiationError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DataTransferState(TransferEvent),
    IncomingMessage(IncomingMessage),
    HandshakeProgress(HandshakeProgress),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DataTransferState(_) => EventKind::DataTransferState,
            Self::IncomingMessage(_) => EventKind::IncomingMessage,
            Self::HandshakeProgress(_) => EventKind::HandshakeProgress,
        }
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// Anything that can receive published events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn publish(&self, event: Event) {
        let _ = self.send(event);
    }
}

// ── Bus ──────────────────────────────────────────────────────────────────────

/// Returned by a handler to continue or halt delivery of the current event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Continue,
    /// Skips every later handler for this event, `once` subscriptions
    /// included; a skipped `once` handler stays registered.
    Stop,
}

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&Event) -> Propagation + Send + Sync>;
type Condition = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
    condition: Option<Condition>,
    /// One-shot subscriptions are removed the first time they fire.
    once: bool,
}

#[derive(Default)]
struct Subscribers {
    persistent: Vec<Subscription>,
    conditional: Vec<Subscription>,
}

/// In-process event bus.
///
/// Handlers run on the publishing thread, outside the internal lock, so a
/// handler may subscribe or unsubscribe. A panicking handler is logged and
/// skipped; delivery continues with the next subscriber.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Propagation + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().persistent.push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
            condition: None,
            once: false,
        });
        id
    }

    /// Subscribe to the next event of `kind` for which `condition` holds.
    ///
    /// With `fire_always` the subscription stays registered and fires on
    /// every matching event instead of only the first.
    pub fn once<F, C>(
        &self,
        kind: EventKind,
        handler: F,
        condition: Option<C>,
        fire_always: bool,
    ) -> SubscriptionId
    where
        F: Fn(&Event) -> Propagation + Send + Sync + 'static,
        C: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let condition = condition.map(|c| Arc::new(c) as Condition);
        self.lock().conditional.push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
            condition,
            once: !fire_always,
        });
        id
    }

    /// Remove one subscription. Unknown ids are ignored.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let before = subs.persistent.len() + subs.conditional.len();
        subs.persistent.retain(|s| s.id != id);
        subs.conditional.retain(|s| s.id != id);
        before != subs.persistent.len() + subs.conditional.len()
    }

    /// Remove every subscription for `kind`.
    pub fn off_all(&self, kind: EventKind) {
        let mut subs = self.lock();
        subs.persistent.retain(|s| s.kind != kind);
        subs.conditional.retain(|s| s.kind != kind);
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let subs = self.lock();
        subs.persistent
            .iter()
            .chain(subs.conditional.iter())
            .filter(|s| s.kind == kind)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        // A poisoned lock only means a handler panicked while registering;
        // the subscriber lists themselves are still consistent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, event: &Event) {
        let kind = event.kind();
        let snapshot: Vec<Subscription> = {
            let subs = self.lock();
            subs.persistent
                .iter()
                .chain(subs.conditional.iter())
                .filter(|s| s.kind == kind)
                .cloned()
                .collect()
        };

        for sub in snapshot {
            if let Some(condition) = &sub.condition {
                match catch_unwind(AssertUnwindSafe(|| condition(event))) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => {
                        warn!(event = "event_condition_panicked", kind = kind.as_str(), subscription = sub.id, "Event condition panicked");
                        continue;
                    }
                }
            }

            // Claim one-shot subscriptions before firing so a concurrent
            // publish cannot deliver to them a second time.
            if sub.once {
                let mut subs = self.lock();
                let before = subs.conditional.len();
                subs.conditional.retain(|s| s.id != sub.id);
                if subs.conditional.len() == before {
                    continue;
                }
            }

            match catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))) {
                Ok(Propagation::Continue) => {}
                Ok(Propagation::Stop) => {
                    debug!(event = "event_propagation_halted", kind = kind.as_str(), subscription = sub.id, "Propagation halted");
                    break;
                }
                Err(_) => {
                    warn!(event = "event_handler_panicked", kind = kind.as_str(), subscription = sub.id, "Event handler panicked");
                }
            }
        }
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) {
        self.dispatch(&event);
    }
}
