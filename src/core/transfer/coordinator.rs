//! WRQ/ACK/ERROR/CANCEL state machine over registered data channels.
//!
//! Every session is keyed by (peer, direction) and mutated only while its
//! own mutex is held: by an API call, by the inbound pump of that peer's
//! channel, or by an expiring timer. Terminal transitions go through
//! [`TransferCoordinator::retire`], which clears the timer and drops the
//! registry entry before any event is published.

use super::session::{SessionRegistry, SessionState, SharedSession, TransferSession};
use super::timeout::TimeoutSupervisor;
use crate::core::config::{ChunkEncoding, TransferSettings};
use crate::core::connection::{ChannelPayload, DataChannel};
use crate::core::errors::TransferError;
use crate::core::events::{Event, EventSink, IncomingMessage, TransferEvent};
use crate::core::peer::{Direction, PeerId, SessionKey};
use crate::core::protocol::{
    decode, Ack, CancelNotice, ChatMessage, ChunkSet, ControlMessage, ErrorNotice, Inbound,
    Progress, WriteRequest,
};
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Application-supplied description of an upload.
#[derive(Debug, Clone, Default)]
pub struct DataInfo {
    pub name: String,
    /// Overrides the configured timeout when set.
    pub timeout_secs: Option<u64>,
}

impl DataInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_secs: None,
        }
    }
}

struct Inner {
    local_id: PeerId,
    settings: TransferSettings,
    events: Arc<dyn EventSink>,
    channels: RwLock<HashMap<PeerId, Arc<dyn DataChannel>>>,
    sessions: SessionRegistry,
    timeouts: TimeoutSupervisor,
}

/// Cheaply cloneable handle; all clones drive the same sessions.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    pub fn new(local_id: PeerId, settings: TransferSettings, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_id,
                settings,
                events,
                channels: RwLock::new(HashMap::new()),
                sessions: SessionRegistry::default(),
                timeouts: TimeoutSupervisor::new(),
            }),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.inner.settings
    }

    // ── Channels ─────────────────────────────────────────────────────────

    pub async fn register_channel(&self, peer_id: PeerId, channel: Arc<dyn DataChannel>) {
        info!(event = "channel_registered", peer = %peer_id, "Data channel registered");
        self.inner.channels.write().await.insert(peer_id, channel);
    }

    /// Forget the channel to `peer_id` and fail every session with it.
    pub async fn unregister_channel(&self, peer_id: &PeerId) {
        if self.inner.channels.write().await.remove(peer_id).is_none() {
            return;
        }
        self.channel_lost(peer_id).await;
    }

    /// [`Self::unregister_channel`], but only while `channel` is the one
    /// registered for `peer_id`. A replaced channel closing is a no-op.
    pub async fn unregister_channel_if(&self, peer_id: &PeerId, channel: &Arc<dyn DataChannel>) -> bool {
        let removed = {
            let mut channels = self.inner.channels.write().await;
            let current = channels
                .get(peer_id)
                .is_some_and(|c| std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(channel)));
            current && channels.remove(peer_id).is_some()
        };
        if removed {
            self.channel_lost(peer_id).await;
        } else {
            debug!(event = "channel_close_stale", peer = %peer_id, "Closed channel is not the registered one");
        }
        removed
    }

    async fn channel_lost(&self, peer_id: &PeerId) {
        info!(event = "channel_unregistered", peer = %peer_id, "Data channel unregistered");

        for (key, shared) in self.inner.sessions.for_peer(peer_id).await {
            let mut session = shared.lock().await;
            if session.is_retired() {
                continue;
            }
            self.retire(&key, &shared, &mut session).await;
            self.publish(TransferEvent::Failed {
                transfer_id: session.transfer_id,
                peer_id: peer_id.clone(),
                direction: key.direction,
                error: TransferError::ChannelClosed,
            });
        }
    }

    pub async fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inner.channels.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Feed inbound frames from `inbound` through [`Self::handle_inbound`],
    /// one at a time, until the sender side is dropped.
    pub fn spawn_pump(
        &self,
        peer_id: PeerId,
        mut inbound: mpsc::UnboundedReceiver<ChannelPayload>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = inbound.recv().await {
                this.handle_inbound(&peer_id, payload).await;
            }
            debug!(event = "pump_finished", peer = %peer_id, "Inbound pump finished");
        })
    }

    /// Register `channel` and start pumping `inbound` for `peer_id`.
    pub async fn connect(
        &self,
        peer_id: PeerId,
        channel: Arc<dyn DataChannel>,
        inbound: mpsc::UnboundedReceiver<ChannelPayload>,
    ) -> JoinHandle<()> {
        self.register_channel(peer_id.clone(), channel).await;
        self.spawn_pump(peer_id, inbound)
    }

    // ── Outbound API ─────────────────────────────────────────────────────

    /// Offer `data` to `target`, or to every open channel when `target` is
    /// `None`. All per-peer sessions of one call share the returned id.
    pub async fn send_data(
        &self,
        data: Bytes,
        info: DataInfo,
        target: Option<PeerId>,
    ) -> Result<Uuid, TransferError> {
        let peers = match &target {
            Some(peer) => {
                if !self.inner.channels.read().await.contains_key(peer) {
                    warn!(event = "transfer_unroutable", peer = %peer, "No open channel to peer");
                    return Err(TransferError::UnroutablePeer(peer.clone()));
                }
                vec![peer.clone()]
            }
            None => {
                let peers = self.open_peers().await;
                if peers.is_empty() {
                    return Err(TransferError::NoOpenChannels);
                }
                peers
            }
        };

        let settings = &self.inner.settings;
        let transfer_id = Uuid::new_v4();
        let timeout_secs = info.timeout_secs.unwrap_or(settings.timeout_secs);
        let chunks = ChunkSet::slice(&data, settings.chunk_size);
        let request = WriteRequest {
            name: info.name.clone(),
            size: chunks.total_size(),
            chunk_size: settings.chunk_size,
            chunk_count: chunks.len(),
            timeout: timeout_secs,
            sender: self.inner.local_id.clone(),
            agent: Some(env!("CARGO_PKG_NAME").to_string()),
        };
        if let Err(error) = request.validate() {
            warn!(event = "transfer_settings_invalid", transfer = %transfer_id, %error, "Refusing to send");
            return Err(error);
        }

        // Lock every new session before it becomes visible so no ACK can
        // be processed ahead of its WRQ.
        let mut started = Vec::with_capacity(peers.len());
        let mut first_error = None;
        for peer in peers {
            let session = TransferSession::outgoing(
                transfer_id,
                peer.clone(),
                info.name.clone(),
                chunks.clone(),
                settings.chunk_size,
                timeout_secs,
            );
            match self.inner.sessions.insert_locked(session).await {
                Ok(guard) => started.push(guard),
                Err(_) => {
                    let error = TransferError::SessionBusy {
                        peer_id: peer.clone(),
                        direction: Direction::Upload,
                    };
                    warn!(event = "transfer_busy", peer = %peer, transfer = %transfer_id, "Upload already in progress");
                    if target.is_some() {
                        return Err(error);
                    }
                    self.publish(TransferEvent::Failed {
                        transfer_id,
                        peer_id: peer,
                        direction: Direction::Upload,
                        error: error.clone(),
                    });
                    first_error.get_or_insert(error);
                }
            }
        }
        if started.is_empty() {
            return Err(first_error.unwrap_or(TransferError::NoOpenChannels));
        }

        self.publish(TransferEvent::UploadStarted {
            transfer_id,
            peer_ids: started.iter().map(|s| s.peer_id().clone()).collect(),
            name: info.name.clone(),
            size: chunks.total_size(),
        });

        for mut session in started {
            let key = session.key.clone();
            let wrq = ControlMessage::Wrq(request.clone());

            match self.send_control(&key.peer_id, &wrq).await {
                Ok(()) => {
                    info!(
                        event = "transfer_requested",
                        peer = %key.peer_id,
                        transfer = %transfer_id,
                        name = %session.name,
                        size = session.total_size,
                        chunks = session.chunk_count,
                        "WRQ sent"
                    );
                    self.arm_timeout(&key, session.timeout());
                }
                Err(error) => {
                    warn!(event = "transfer_request_failed", peer = %key.peer_id, %error, "WRQ send failed");
                    if let Some(shared) = self.inner.sessions.get(&key).await {
                        self.retire(&key, &shared, &mut session).await;
                    }
                    self.publish(TransferEvent::Failed {
                        transfer_id,
                        peer_id: key.peer_id.clone(),
                        direction: Direction::Upload,
                        error,
                    });
                }
            }
        }

        Ok(transfer_id)
    }

    /// Accept or reject the pending upload request from `peer_id`.
    pub async fn respond_request(&self, peer_id: &PeerId, accept: bool) -> Result<(), TransferError> {
        let key = SessionKey::download(peer_id.clone());
        let shared = self.session_for(&key).await?;
        let mut session = shared.lock().await;
        if session.state != SessionState::RequestReceived {
            return Err(TransferError::UnknownSession {
                peer_id: peer_id.clone(),
                direction: Direction::Download,
            });
        }

        let ack_n = if accept { 0 } else { Ack::REJECT };
        let ack = ControlMessage::Ack(Ack {
            ack_n,
            sender: self.inner.local_id.clone(),
        });
        if let Err(error) = self.send_control(peer_id, &ack).await {
            self.fail(&key, &shared, &mut session, error.clone(), false).await;
            return Err(error);
        }

        if !accept {
            info!(event = "transfer_rejected", peer = %peer_id, name = %session.name, "Upload request rejected");
            self.retire(&key, &shared, &mut session).await;
            self.publish(TransferEvent::Rejected {
                transfer_id: session.transfer_id,
                peer_id: peer_id.clone(),
                direction: Direction::Download,
                name: session.name.clone(),
            });
            return Ok(());
        }

        info!(event = "transfer_accepted", peer = %peer_id, name = %session.name, "Upload request accepted");
        session.state = SessionState::Receiving;
        session.ack_sequence = 0;
        self.publish(TransferEvent::DownloadStarted {
            transfer_id: session.transfer_id,
            peer_id: peer_id.clone(),
            name: session.name.clone(),
            size: session.total_size,
        });

        if session.chunk_count == 0 {
            self.complete_download(&key, &shared, &mut session).await;
        } else {
            self.arm_timeout(&key, session.timeout());
        }
        Ok(())
    }

    /// Abort the session with `peer_id` in `direction` and tell the peer.
    ///
    /// Returns [`TransferError::UnknownSession`] if the session has already
    /// finished.
    pub async fn cancel_transfer(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        reason: &str,
    ) -> Result<(), TransferError> {
        let key = SessionKey::new(peer_id.clone(), direction);
        let shared = self.session_for(&key).await?;
        let mut session = shared.lock().await;
        if session.is_retired() {
            return Err(TransferError::UnknownSession {
                peer_id: peer_id.clone(),
                direction,
            });
        }

        self.retire(&key, &shared, &mut session).await;
        let cancel = ControlMessage::Cancel(CancelNotice {
            name: session.name.clone(),
            content: reason.to_string(),
            sender: self.inner.local_id.clone(),
            is_upload_error: direction.is_upload(),
        });
        if let Err(error) = self.send_control(peer_id, &cancel).await {
            warn!(event = "cancel_send_failed", peer = %peer_id, %error, "CANCEL could not be delivered");
        }

        info!(event = "transfer_cancelled", peer = %peer_id, direction = %direction, name = %session.name, "Transfer cancelled locally");
        self.publish(TransferEvent::Cancelled {
            transfer_id: session.transfer_id,
            peer_id: peer_id.clone(),
            direction,
            name: session.name.clone(),
            message: reason.to_string(),
            cancelled_by: self.inner.local_id.clone(),
        });
        Ok(())
    }

    /// Send a MESSAGE to `target`, or to every open channel, and publish the
    /// local echo.
    pub async fn send_message(&self, content: Value, target: Option<PeerId>) -> Result<(), TransferError> {
        let peers = match &target {
            Some(peer) => {
                if !self.inner.channels.read().await.contains_key(peer) {
                    return Err(TransferError::UnroutablePeer(peer.clone()));
                }
                vec![peer.clone()]
            }
            None => self.open_peers().await,
        };

        let message = ControlMessage::Message(ChatMessage {
            sender: self.inner.local_id.clone(),
            target: target.clone(),
            data: content.clone(),
            is_private: target.is_some(),
        });
        for peer in &peers {
            if let Err(error) = self.send_control(peer, &message).await {
                warn!(event = "message_send_failed", peer = %peer, %error, "MESSAGE send failed");
                if target.is_some() {
                    return Err(error);
                }
            }
        }

        self.inner.events.publish(Event::IncomingMessage(IncomingMessage {
            content,
            is_private: target.is_some(),
            target_peer_id: target,
            sender_peer_id: self.inner.local_id.clone(),
            is_self: true,
        }));
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Handle one frame received from `peer_id`.
    pub async fn handle_inbound(&self, peer_id: &PeerId, payload: ChannelPayload) {
        match decode(payload) {
            Inbound::Control(ControlMessage::Wrq(wrq)) => self.on_write_request(peer_id, wrq).await,
            Inbound::Control(ControlMessage::Ack(ack)) => self.on_ack(peer_id, ack).await,
            Inbound::Control(ControlMessage::Error(notice)) => self.on_error(peer_id, notice).await,
            Inbound::Control(ControlMessage::Cancel(notice)) => self.on_cancel(peer_id, notice).await,
            Inbound::Control(ControlMessage::Message(msg)) => self.on_message(peer_id, msg),
            Inbound::Chunk(data) => self.on_chunk(peer_id, Ok(data)).await,
            Inbound::TextChunk(text) => {
                let decoded = tokio::task::spawn_blocking(move || {
                    base64::engine::general_purpose::STANDARD.decode(text.as_bytes())
                })
                .await;
                let data = match decoded {
                    Ok(Ok(bytes)) => Ok(Bytes::from(bytes)),
                    Ok(Err(e)) => Err(TransferError::MalformedChunk(format!("invalid base64: {e}"))),
                    Err(e) => Err(TransferError::MalformedChunk(format!("decode task failed: {e}"))),
                };
                self.on_chunk(peer_id, data).await;
            }
            Inbound::Unsupported { kind, reason } => {
                warn!(event = "message_unsupported", peer = %peer_id, kind = %kind, reason = %reason, "Dropping unsupported message");
            }
        }
    }

    async fn on_write_request(&self, peer_id: &PeerId, wrq: WriteRequest) {
        let key = SessionKey::download(peer_id.clone());
        let transfer_id = Uuid::new_v4();

        if let Err(error) = wrq.validate() {
            warn!(event = "transfer_request_invalid", peer = %peer_id, %error, "Invalid WRQ");
            let notice = ControlMessage::Error(ErrorNotice {
                name: wrq.name.clone(),
                content: error.to_string(),
                is_upload_error: false,
                sender: self.inner.local_id.clone(),
            });
            if let Err(send_error) = self.send_control(peer_id, &notice).await {
                debug!(event = "error_notice_failed", peer = %peer_id, error = %send_error, "ERROR not delivered");
            }
            self.publish(TransferEvent::Failed {
                transfer_id,
                peer_id: peer_id.clone(),
                direction: Direction::Download,
                error,
            });
            return;
        }

        // A fresh WRQ replaces whatever download the peer had going.
        let session = loop {
            let incoming = TransferSession::incoming(transfer_id, peer_id.clone(), &wrq);
            match self.inner.sessions.insert_locked(incoming).await {
                Ok(guard) => break guard,
                Err(existing) => {
                    let mut old = existing.lock().await;
                    if !old.is_retired() {
                        warn!(event = "transfer_superseded", peer = %peer_id, name = %old.name, "New WRQ supersedes running download");
                        self.retire(&key, &existing, &mut old).await;
                        self.publish(TransferEvent::Failed {
                            transfer_id: old.transfer_id,
                            peer_id: peer_id.clone(),
                            direction: Direction::Download,
                            error: TransferError::Superseded,
                        });
                    } else {
                        self.inner.sessions.remove_if(&key, &existing).await;
                    }
                }
            }
        };

        info!(
            event = "transfer_request_received",
            peer = %peer_id,
            name = %wrq.name,
            size = wrq.size,
            chunks = wrq.chunk_count,
            "WRQ received"
        );
        self.arm_timeout(&key, session.timeout());
        self.publish(TransferEvent::UploadRequest {
            transfer_id: session.transfer_id,
            peer_id: peer_id.clone(),
            name: session.name.clone(),
            size: session.total_size,
            chunk_size: session.chunk_size,
            chunk_count: session.chunk_count,
            timeout_secs: session.timeout_secs,
            agent: wrq.agent,
        });
    }

    async fn on_ack(&self, peer_id: &PeerId, ack: Ack) {
        let key = SessionKey::upload(peer_id.clone());
        let Some(shared) = self.inner.sessions.get(&key).await else {
            debug!(event = "ack_stale", peer = %peer_id, ack = ack.ack_n, "ACK for no upload session");
            return;
        };
        let mut session = shared.lock().await;
        if session.is_retired() {
            return;
        }

        if ack.is_reject() && session.state == SessionState::Requested {
            info!(event = "transfer_rejected", peer = %peer_id, name = %session.name, "Peer rejected upload");
            self.retire(&key, &shared, &mut session).await;
            self.publish(TransferEvent::Rejected {
                transfer_id: session.transfer_id,
                peer_id: peer_id.clone(),
                direction: Direction::Upload,
                name: session.name.clone(),
            });
            return;
        }

        let expected = session.expected_ack();
        let n = match (expected, u64::try_from(ack.ack_n)) {
            (Some(expected), Ok(n)) if expected == n => n,
            _ => {
                debug!(event = "ack_out_of_order", peer = %peer_id, ack = ack.ack_n, ?expected, "Ignoring ACK");
                return;
            }
        };
        session.ack_sequence = n;

        if n == session.chunk_count {
            info!(event = "transfer_upload_completed", peer = %peer_id, name = %session.name, "Upload completed");
            self.retire(&key, &shared, &mut session).await;
            self.publish(TransferEvent::UploadCompleted {
                transfer_id: session.transfer_id,
                peer_id: peer_id.clone(),
                name: session.name.clone(),
            });
            return;
        }

        if n == 0 {
            debug!(event = "transfer_upload_accepted", peer = %peer_id, name = %session.name, "Peer accepted upload");
        }
        session.state = SessionState::Sending;
        let Some(chunk) = session.chunk(n) else {
            let error = TransferError::MalformedChunk(format!("no chunk {n}"));
            self.fail(&key, &shared, &mut session, error, true).await;
            return;
        };
        let len = chunk.len() as u64;
        let frame = match self.encode_chunk(chunk).await {
            Ok(frame) => frame,
            Err(error) => {
                self.fail(&key, &shared, &mut session, error, true).await;
                return;
            }
        };
        if let Err(error) = self.send_to(peer_id, frame).await {
            self.fail(&key, &shared, &mut session, error, false).await;
            return;
        }

        session.bytes_transferred += len;
        self.arm_timeout(&key, session.timeout());
        self.publish(TransferEvent::Uploading {
            transfer_id: session.transfer_id,
            peer_id: peer_id.clone(),
            percentage: session.percentage(),
        });
    }

    async fn on_chunk(&self, peer_id: &PeerId, data: Result<Bytes, TransferError>) {
        let key = SessionKey::download(peer_id.clone());
        let Some(shared) = self.inner.sessions.get(&key).await else {
            debug!(event = "chunk_stale", peer = %peer_id, "Chunk for no download session");
            return;
        };
        let mut session = shared.lock().await;
        if session.state != SessionState::Receiving {
            debug!(event = "chunk_unexpected", peer = %peer_id, state = ?session.state, "Ignoring chunk");
            return;
        }

        let pushed = match data {
            Ok(data) => match session.assembler_mut() {
                Some(assembler) => assembler.push(&data),
                None => Err(TransferError::MalformedChunk("no assembler".into())),
            },
            Err(error) => Err(error),
        };
        let progress = match pushed {
            Ok(progress) => progress,
            Err(error) => {
                warn!(event = "chunk_rejected", peer = %peer_id, name = %session.name, %error, "Aborting download");
                self.fail(&key, &shared, &mut session, error, true).await;
                return;
            }
        };

        let received = match progress {
            Progress::More { next } => next,
            Progress::Complete => session.chunk_count,
        };
        session.ack_sequence = received;
        session.bytes_transferred = session
            .assembler_mut()
            .map(|a| a.bytes_received())
            .unwrap_or_default();

        let ack = ControlMessage::Ack(Ack {
            ack_n: received as i64,
            sender: self.inner.local_id.clone(),
        });
        if let Err(error) = self.send_control(peer_id, &ack).await {
            self.fail(&key, &shared, &mut session, error, false).await;
            return;
        }

        match progress {
            Progress::Complete => self.complete_download(&key, &shared, &mut session).await,
            Progress::More { .. } => {
                self.arm_timeout(&key, session.timeout());
                self.publish(TransferEvent::Downloading {
                    transfer_id: session.transfer_id,
                    peer_id: peer_id.clone(),
                    percentage: session.percentage(),
                });
            }
        }
    }

    async fn on_error(&self, peer_id: &PeerId, notice: ErrorNotice) {
        let direction = remote_to_local(notice.is_upload_error);
        let key = SessionKey::new(peer_id.clone(), direction);
        let Some(shared) = self.inner.sessions.get(&key).await else {
            debug!(event = "error_stale", peer = %peer_id, direction = %direction, "ERROR for no session");
            return;
        };
        let mut session = shared.lock().await;
        if session.is_retired() {
            return;
        }

        warn!(event = "transfer_remote_error", peer = %peer_id, direction = %direction, content = %notice.content, "Peer aborted transfer");
        self.retire(&key, &shared, &mut session).await;
        self.publish(TransferEvent::Failed {
            transfer_id: session.transfer_id,
            peer_id: peer_id.clone(),
            direction,
            error: TransferError::Remote(notice.content),
        });
    }

    async fn on_cancel(&self, peer_id: &PeerId, notice: CancelNotice) {
        let direction = remote_to_local(notice.is_upload_error);
        let key = SessionKey::new(peer_id.clone(), direction);
        let Some(shared) = self.inner.sessions.get(&key).await else {
            debug!(event = "cancel_stale", peer = %peer_id, direction = %direction, "CANCEL for no session");
            return;
        };
        let mut session = shared.lock().await;
        if session.is_retired() {
            return;
        }

        info!(event = "transfer_cancelled_by_peer", peer = %peer_id, direction = %direction, name = %session.name, "Peer cancelled transfer");
        self.retire(&key, &shared, &mut session).await;
        self.publish(TransferEvent::Cancelled {
            transfer_id: session.transfer_id,
            peer_id: peer_id.clone(),
            direction,
            name: session.name.clone(),
            message: notice.content,
            cancelled_by: notice.sender,
        });
    }

    fn on_message(&self, peer_id: &PeerId, msg: ChatMessage) {
        debug!(event = "message_received", peer = %peer_id, private = msg.is_private, "MESSAGE received");
        self.inner.events.publish(Event::IncomingMessage(IncomingMessage {
            content: msg.data,
            is_private: msg.is_private,
            target_peer_id: msg.target,
            sender_peer_id: peer_id.clone(),
            is_self: false,
        }));
    }

    // ── Timeouts ─────────────────────────────────────────────────────────

    fn arm_timeout(&self, key: &SessionKey, after: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let expired = key.clone();
        self.inner.timeouts.arm(key.clone(), after, move |generation| async move {
            if let Some(inner) = weak.upgrade() {
                TransferCoordinator { inner }.expire(expired, generation).await;
            }
        });
    }

    async fn expire(&self, key: SessionKey, generation: u64) {
        let Some(shared) = self.inner.sessions.get(&key).await else {
            return;
        };
        let mut session = shared.lock().await;
        if session.is_retired() || !self.inner.timeouts.claim(&key, generation) {
            return;
        }

        let seconds = session.timeout_secs;
        warn!(event = "transfer_timeout", key = %key, name = %session.name, seconds, "Transfer timed out");
        session.retire();
        session.release();
        self.inner.sessions.remove_if(&key, &shared).await;

        let notice = ControlMessage::Error(ErrorNotice {
            name: session.name.clone(),
            content: format!(
                "Connection Timeout. Longer than {seconds} seconds. Connection is abolished."
            ),
            is_upload_error: key.direction.is_upload(),
            sender: self.inner.local_id.clone(),
        });
        if let Err(error) = self.send_control(&key.peer_id, &notice).await {
            debug!(event = "timeout_notice_failed", key = %key, %error, "Timeout ERROR not delivered");
        }
        self.publish(TransferEvent::Failed {
            transfer_id: session.transfer_id,
            peer_id: key.peer_id.clone(),
            direction: key.direction,
            error: TransferError::Timeout { seconds },
        });
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn session_for(&self, key: &SessionKey) -> Result<SharedSession, TransferError> {
        self.inner
            .sessions
            .get(key)
            .await
            .ok_or_else(|| TransferError::UnknownSession {
                peer_id: key.peer_id.clone(),
                direction: key.direction,
            })
    }

    /// Terminal transition: disarm, release buffers, drop from the registry.
    async fn retire(&self, key: &SessionKey, shared: &SharedSession, session: &mut TransferSession) {
        session.retire();
        self.inner.timeouts.clear(key);
        if key.direction == Direction::Upload {
            session.release();
        }
        self.inner.sessions.remove_if(key, shared).await;
    }

    /// Retire with an error, optionally telling the peer first.
    async fn fail(
        &self,
        key: &SessionKey,
        shared: &SharedSession,
        session: &mut TransferSession,
        error: TransferError,
        notify_peer: bool,
    ) {
        self.retire(key, shared, session).await;
        session.release();
        if notify_peer {
            let notice = ControlMessage::Error(ErrorNotice {
                name: session.name.clone(),
                content: error.to_string(),
                is_upload_error: key.direction.is_upload(),
                sender: self.inner.local_id.clone(),
            });
            if let Err(send_error) = self.send_control(&key.peer_id, &notice).await {
                debug!(event = "error_notice_failed", key = %key, error = %send_error, "ERROR not delivered");
            }
        }
        self.publish(TransferEvent::Failed {
            transfer_id: session.transfer_id,
            peer_id: key.peer_id.clone(),
            direction: key.direction,
            error,
        });
    }

    async fn complete_download(&self, key: &SessionKey, shared: &SharedSession, session: &mut TransferSession) {
        info!(event = "transfer_download_completed", peer = %key.peer_id, name = %session.name, size = session.total_size, "Download completed");
        self.retire(key, shared, session).await;
        let data = session.release().unwrap_or_default();
        self.publish(TransferEvent::DownloadCompleted {
            transfer_id: session.transfer_id,
            peer_id: key.peer_id.clone(),
            name: session.name.clone(),
            data,
        });
    }

    async fn encode_chunk(&self, chunk: Bytes) -> Result<ChannelPayload, TransferError> {
        match self.inner.settings.encoding {
            ChunkEncoding::Binary => Ok(ChannelPayload::Binary(chunk)),
            ChunkEncoding::Base64 => tokio::task::spawn_blocking(move || {
                base64::engine::general_purpose::STANDARD.encode(&chunk)
            })
            .await
            .map(ChannelPayload::Text)
            .map_err(|e| TransferError::Send(format!("chunk encoding failed: {e}"))),
        }
    }

    async fn send_control(&self, peer_id: &PeerId, message: &ControlMessage) -> Result<(), TransferError> {
        let payload = message
            .to_payload()
            .map_err(|e| TransferError::Send(e.to_string()))?;
        self.send_to(peer_id, payload).await
    }

    async fn send_to(&self, peer_id: &PeerId, payload: ChannelPayload) -> Result<(), TransferError> {
        let channel = self
            .inner
            .channels
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| TransferError::UnroutablePeer(peer_id.clone()))?;
        channel
            .send(payload)
            .await
            .map_err(|e| TransferError::Send(format!("{e:#}")))
    }

    fn publish(&self, event: TransferEvent) {
        self.inner.events.publish(Event::DataTransferState(event));
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub async fn session_state(&self, peer_id: &PeerId, direction: Direction) -> Option<SessionState> {
        let shared = self
            .inner
            .sessions
            .get(&SessionKey::new(peer_id.clone(), direction))
            .await?;
        let state = shared.lock().await.state;
        Some(state)
    }

    pub async fn active_sessions(&self) -> usize {
        self.inner.sessions.len().await
    }

    pub fn armed_timeouts(&self) -> usize {
        self.inner.timeouts.armed_count()
    }
}

/// A notice flagged as an upload error came from the uploader, so it
/// concerns our download, and vice versa.
fn remote_to_local(is_upload_error: bool) -> Direction {
    let remote = if is_upload_error {
        Direction::Upload
    } else {
        Direction::Download
    };
    remote.opposite()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<Event>>);

    impl EventSink for Recorder {
        fn publish(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn coordinator(id: &str) -> (TransferCoordinator, Arc<Recorder>) {
        coordinator_with(
            id,
            TransferSettings {
                chunk_size: 4,
                timeout_secs: 5,
                encoding: ChunkEncoding::Binary,
            },
        )
    }

    fn coordinator_with(id: &str, settings: TransferSettings) -> (TransferCoordinator, Arc<Recorder>) {
        let events = Arc::new(Recorder(Mutex::new(Vec::new())));
        (TransferCoordinator::new(PeerId::from(id), settings, events.clone()), events)
    }

    #[test]
    fn remote_error_flag_maps_to_local_direction() {
        assert_eq!(remote_to_local(true), Direction::Download);
        assert_eq!(remote_to_local(false), Direction::Upload);
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_unroutable() {
        let (alice, events) = coordinator("alice");
        let result = alice
            .send_data(Bytes::from_static(b"hello"), DataInfo::named("f"), Some(PeerId::from("bob")))
            .await;

        assert_eq!(result, Err(TransferError::UnroutablePeer(PeerId::from("bob"))));
        assert_eq!(alice.active_sessions().await, 0);
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_without_channels_fails() {
        let (alice, _) = coordinator("alice");
        let result = alice.send_data(Bytes::from_static(b"x"), DataInfo::named("f"), None).await;
        assert_eq!(result, Err(TransferError::NoOpenChannels));
    }

    #[tokio::test]
    async fn wrq_creates_pending_download_and_arms_timeout() {
        let (bob, events) = coordinator("bob");
        let (a, _b) = memory::pair("data");
        bob.register_channel(PeerId::from("alice"), a.channel).await;

        let wrq = json!({"type": "WRQ", "name": "f", "size": 9, "chunkSize": 4, "chunkCount": 3, "timeout": 5, "sender": "alice"});
        bob.handle_inbound(&PeerId::from("alice"), ChannelPayload::Text(wrq.to_string()))
            .await;

        assert_eq!(
            bob.session_state(&PeerId::from("alice"), Direction::Download).await,
            Some(SessionState::RequestReceived)
        );
        assert_eq!(bob.armed_timeouts(), 1);
        let recorded = events.0.lock().unwrap();
        assert!(matches!(
            recorded.as_slice(),
            [Event::DataTransferState(TransferEvent::UploadRequest { chunk_count: 3, .. })]
        ));
    }

    #[tokio::test]
    async fn respond_without_request_is_unknown_session() {
        let (bob, _) = coordinator("bob");
        let result = bob.respond_request(&PeerId::from("alice"), true).await;
        assert!(matches!(result, Err(TransferError::UnknownSession { .. })));
    }

    #[tokio::test]
    async fn invalid_wrq_is_answered_with_error() {
        let (bob, events) = coordinator("bob");
        let (a, mut b) = memory::pair("data");
        bob.register_channel(PeerId::from("alice"), a.channel).await;

        let wrq = json!({"type": "WRQ", "name": "f", "size": 9, "chunkSize": 4, "chunkCount": 2, "timeout": 5, "sender": "alice"});
        bob.handle_inbound(&PeerId::from("alice"), ChannelPayload::Text(wrq.to_string()))
            .await;

        let Some(ChannelPayload::Text(reply)) = b.inbound.recv().await else {
            panic!("expected an ERROR frame");
        };
        assert!(reply.contains("\"type\":\"ERROR\""));
        assert_eq!(bob.active_sessions().await, 0);
        assert!(matches!(
            events.0.lock().unwrap().as_slice(),
            [Event::DataTransferState(TransferEvent::Failed { error: TransferError::InvalidRequest(_), .. })]
        ));
    }

    #[tokio::test]
    async fn unregister_fails_live_sessions() {
        let (bob, events) = coordinator("bob");
        let (a, _b) = memory::pair("data");
        let alice = PeerId::from("alice");
        bob.register_channel(alice.clone(), a.channel).await;

        let wrq = json!({"type": "WRQ", "name": "f", "size": 1, "chunkSize": 4, "chunkCount": 1, "timeout": 5, "sender": "alice"});
        bob.handle_inbound(&alice, ChannelPayload::Text(wrq.to_string())).await;
        bob.unregister_channel(&alice).await;

        assert_eq!(bob.active_sessions().await, 0);
        assert_eq!(bob.armed_timeouts(), 0);
        let recorded = events.0.lock().unwrap();
        assert!(matches!(
            recorded.last(),
            Some(Event::DataTransferState(TransferEvent::Failed { error: TransferError::ChannelClosed, .. }))
        ));
    }

    #[tokio::test]
    async fn closing_a_replaced_channel_keeps_the_peer() {
        let (alice, events) = coordinator("alice");
        let bob = PeerId::from("bob");
        let (first, _first_remote) = memory::pair("data");
        let (second, _second_remote) = memory::pair("data");
        let first: Arc<dyn DataChannel> = first.channel;
        let second: Arc<dyn DataChannel> = second.channel;

        alice.register_channel(bob.clone(), first.clone()).await;
        alice
            .send_data(Bytes::from_static(b"hello"), DataInfo::named("f"), Some(bob.clone()))
            .await
            .unwrap();
        alice.register_channel(bob.clone(), second.clone()).await;

        assert!(!alice.unregister_channel_if(&bob, &first).await);
        assert_eq!(alice.open_peers().await, vec![bob.clone()]);
        assert_eq!(alice.active_sessions().await, 1);
        assert!(!events.0.lock().unwrap().iter().any(|e| matches!(
            e,
            Event::DataTransferState(TransferEvent::Failed { .. })
        )));

        assert!(alice.unregister_channel_if(&bob, &second).await);
        assert!(alice.open_peers().await.is_empty());
        assert_eq!(alice.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn send_rejects_invalid_local_settings() {
        let (a, _b) = memory::pair("data");
        let bob = PeerId::from("bob");
        let zero_chunks = TransferSettings {
            chunk_size: 0,
            timeout_secs: 5,
            encoding: ChunkEncoding::Binary,
        };
        let (alice, events) = coordinator_with("alice", zero_chunks);
        alice.register_channel(bob.clone(), a.channel).await;

        let result = alice
            .send_data(Bytes::from_static(b"hello"), DataInfo::named("f"), Some(bob.clone()))
            .await;
        assert!(matches!(result, Err(TransferError::InvalidRequest(_))));
        assert_eq!(alice.active_sessions().await, 0);
        assert_eq!(alice.armed_timeouts(), 0);
        assert!(events.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_rejects_out_of_range_timeout() {
        let (alice, _) = coordinator("alice");
        let (a, _b) = memory::pair("data");
        let bob = PeerId::from("bob");
        alice.register_channel(bob.clone(), a.channel).await;

        for timeout in [0, crate::core::config::MAX_TIMEOUT_SECS + 1] {
            let info = DataInfo {
                name: "f".into(),
                timeout_secs: Some(timeout),
            };
            let result = alice
                .send_data(Bytes::from_static(b"hello"), info, Some(bob.clone()))
                .await;
            assert!(matches!(result, Err(TransferError::InvalidRequest(_))), "timeout {timeout}");
        }
        assert_eq!(alice.active_sessions().await, 0);
    }
}
