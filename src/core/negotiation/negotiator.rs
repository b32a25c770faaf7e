//! Per-peer handshake driver.
//!
//! ```text
//! A (joins)                          B (in room)
//!   │── enter ──────────────────────▶│  handshakeProgress(enter)
//!   │◀───────────────────── welcome ─│
//!   │ role resolution                │
//!   │── offer ──────────────────────▶│  (or welcome{weight:-1} to hand off)
//!   │◀────────────────────── answer ─│
//!   │◀──────── candidates ─────────▶│  (trickle only)
//! ```
//!
//! When both sides enter at once each receives the other's `welcome`; only
//! the side with the greater peer id goes on to resolve roles, the other
//! waits for its offer. Candidates that arrive before the remote
//! description are queued and applied once it is set.

use super::role::{AgentInfo, CapabilityMatrix, Role};
use super::sdp;
use crate::core::config::{NegotiatorSettings, ICE_GATHER_TIMEOUT};
use crate::core::connection::{
    IceCandidate, PeerConnection, SdpType, SessionDescription, SignalingChannel,
    SignalingEnvelope, SignalingMessage,
};
use crate::core::errors::NegotiationError;
use crate::core::events::{Event, EventSink, HandshakeProgress, HandshakeStep};
use crate::core::peer::PeerId;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Creates the peer connection for a remote peer seen for the first time.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, peer_id: &PeerId) -> Result<Arc<dyn PeerConnection>>;
}

/// Handshake bookkeeping for one remote peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationState {
    pub role: Role,
    pub committed_offer: bool,
    pub committed_answer: bool,
    /// Set once an offer was created in the current round.
    pub offer_attempted: bool,
    pub round: u32,
}

impl NegotiationState {
    fn is_committed(&self, kind: SdpType) -> bool {
        match kind {
            SdpType::Offer => self.committed_offer,
            SdpType::Answer => self.committed_answer,
        }
    }

    fn commit(&mut self, kind: SdpType) {
        match kind {
            SdpType::Offer => self.committed_offer = true,
            SdpType::Answer => self.committed_answer = true,
        }
    }
}

struct PeerNegotiation {
    pc: Arc<dyn PeerConnection>,
    remote_agent: Option<AgentInfo>,
    state: NegotiationState,
    /// We answered this peer's `enter`, so a `welcome` from it means both
    /// sides entered at once.
    welcomed: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    candidate_task: Option<JoinHandle<()>>,
}

impl Drop for PeerNegotiation {
    fn drop(&mut self) {
        if let Some(task) = self.candidate_task.take() {
            task.abort();
        }
    }
}

type SharedPeer = Arc<Mutex<PeerNegotiation>>;

struct Inner {
    local_id: PeerId,
    settings: NegotiatorSettings,
    capabilities: CapabilityMatrix,
    signaling: Arc<dyn SignalingChannel>,
    factory: Arc<dyn PeerConnectionFactory>,
    events: Arc<dyn EventSink>,
    peers: RwLock<HashMap<PeerId, SharedPeer>>,
}

/// Cheaply cloneable handle.
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl Negotiator {
    pub fn new(
        local_id: PeerId,
        settings: NegotiatorSettings,
        signaling: Arc<dyn SignalingChannel>,
        factory: Arc<dyn PeerConnectionFactory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let capabilities = CapabilityMatrix::new(settings.capability_rules.clone());
        Self {
            inner: Arc::new(Inner {
                local_id,
                settings,
                capabilities,
                signaling,
                factory,
                events,
                peers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    // ── Peers ────────────────────────────────────────────────────────────

    /// Track `pc` for `peer_id`, replacing any previous connection.
    pub async fn add_peer(&self, peer_id: PeerId, pc: Arc<dyn PeerConnection>) {
        self.insert_peer(peer_id, pc).await;
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let removed = self.inner.peers.write().await.remove(peer_id).is_some();
        if removed {
            info!(event = "negotiation_peer_removed", peer = %peer_id, "Peer removed");
        }
        removed
    }

    pub async fn state(&self, peer_id: &PeerId) -> Option<NegotiationState> {
        let peer = self.inner.peers.read().await.get(peer_id).cloned()?;
        let state = peer.lock().await.state.clone();
        Some(state)
    }

    async fn insert_peer(&self, peer_id: PeerId, pc: Arc<dyn PeerConnection>) -> SharedPeer {
        let candidate_task = if self.inner.settings.ice_trickle {
            self.spawn_candidate_forwarder(&peer_id, pc.as_ref())
        } else {
            None
        };
        let peer = Arc::new(Mutex::new(PeerNegotiation {
            pc,
            remote_agent: None,
            state: NegotiationState::default(),
            welcomed: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            candidate_task,
        }));
        self.inner.peers.write().await.insert(peer_id.clone(), peer.clone());
        debug!(event = "negotiation_peer_added", peer = %peer_id, "Peer added");
        peer
    }

    async fn peer(&self, peer_id: &PeerId) -> Result<SharedPeer, NegotiationError> {
        self.inner
            .peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NegotiationError::UnknownPeer(peer_id.clone()))
    }

    async fn peer_or_create(&self, peer_id: &PeerId) -> Result<SharedPeer, NegotiationError> {
        if let Some(peer) = self.inner.peers.read().await.get(peer_id).cloned() {
            return Ok(peer);
        }
        let pc = self
            .inner
            .factory
            .create(peer_id)
            .await
            .map_err(|e| NegotiationError::PeerConnection(format!("{e:#}")))?;
        Ok(self.insert_peer(peer_id.clone(), pc).await)
    }

    fn spawn_candidate_forwarder(&self, peer_id: &PeerId, pc: &dyn PeerConnection) -> Option<JoinHandle<()>> {
        let mut candidates = pc.take_local_candidates()?;
        let signaling = self.inner.signaling.clone();
        let room_id = self.inner.settings.room_id.clone();
        let (local, target) = (self.inner.local_id.clone(), peer_id.clone());

        Some(tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                let envelope = SignalingEnvelope {
                    room_id: room_id.clone(),
                    sender: local.clone(),
                    target: Some(target.clone()),
                    message: SignalingMessage::Candidate { candidate },
                };
                if let Err(e) = signaling.send(envelope).await {
                    warn!(event = "candidate_send_failed", peer = %target, error = %e, "Failed to forward ICE candidate");
                }
            }
        }))
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Announce this side to the room.
    pub async fn send_enter(&self) -> Result<(), NegotiationError> {
        let message = SignalingMessage::Enter {
            agent: self.inner.settings.local_agent.clone(),
        };
        self.signal(None, message).await
    }

    /// Start a negotiation round with `peer_id`: offer if the capability
    /// rules allow it, otherwise ask the peer to offer.
    pub async fn negotiate(&self, peer_id: &PeerId) -> Result<Role, NegotiationError> {
        let shared = self.peer(peer_id).await?;
        let mut peer = shared.lock().await;
        peer.state.round += 1;
        peer.state.offer_attempted = false;

        let remote = peer
            .remote_agent
            .clone()
            .unwrap_or_else(|| AgentInfo::new("unknown", 0));
        let role = self.inner.capabilities.resolve(&remote);
        info!(
            event = "negotiation_role_resolved",
            peer = %peer_id,
            remote_agent = %remote.name,
            remote_version = remote.version,
            role = ?role,
            round = peer.state.round,
            "Role resolved"
        );

        match role {
            Role::Offerer => self.offer(peer_id, &mut peer).await?,
            _ => {
                peer.state.role = Role::Answerer;
                let handoff = SignalingMessage::Welcome {
                    agent: self.inner.settings.local_agent.clone(),
                    weight: -1,
                };
                if let Err(e) = self.signal(Some(peer_id.clone()), handoff).await {
                    return Err(self.fail(peer_id, e));
                }
            }
        }
        Ok(role)
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    /// Apply one signaling message. Envelopes for another room, addressed
    /// to another peer, or sent by this side are ignored.
    pub async fn handle_signal(&self, envelope: SignalingEnvelope) -> Result<(), NegotiationError> {
        let inner = &self.inner;
        if envelope.room_id != inner.settings.room_id
            || envelope.sender == inner.local_id
            || envelope.target.as_ref().is_some_and(|t| t != &inner.local_id)
        {
            return Ok(());
        }
        let peer_id = envelope.sender;
        debug!(event = "signal_received", peer = %peer_id, kind = envelope.message.kind(), "Signaling message");

        match envelope.message {
            SignalingMessage::Enter { agent } => {
                let shared = self.peer_or_create(&peer_id).await.map_err(|e| self.fail(&peer_id, e))?;
                {
                    let mut peer = shared.lock().await;
                    peer.remote_agent = Some(agent);
                    peer.welcomed = true;
                }
                self.progress(&peer_id, HandshakeStep::Enter, None);

                let welcome = SignalingMessage::Welcome {
                    agent: inner.settings.local_agent.clone(),
                    weight: 0,
                };
                self.signal(Some(peer_id.clone()), welcome)
                    .await
                    .map_err(|e| self.fail(&peer_id, e))
            }
            SignalingMessage::Welcome { agent, weight } => {
                let shared = self.peer_or_create(&peer_id).await.map_err(|e| self.fail(&peer_id, e))?;
                let simultaneous = {
                    let mut peer = shared.lock().await;
                    peer.remote_agent = Some(agent);
                    peer.welcomed
                };
                self.progress(&peer_id, HandshakeStep::Welcome, None);

                if weight < 0 {
                    // Role handoff: the peer cannot offer, so we must.
                    let mut peer = shared.lock().await;
                    peer.state.round += 1;
                    peer.state.offer_attempted = false;
                    self.offer(&peer_id, &mut peer).await
                } else if simultaneous && !self.leads(&peer_id) {
                    debug!(event = "negotiation_glare_yield", peer = %peer_id, "Both sides entered; waiting for peer to lead");
                    Ok(())
                } else {
                    self.negotiate(&peer_id).await.map(|_| ())
                }
            }
            SignalingMessage::Offer { sdp } => {
                let shared = self.peer_or_create(&peer_id).await.map_err(|e| self.fail(&peer_id, e))?;
                let mut peer = shared.lock().await;
                self.progress(&peer_id, HandshakeStep::Offer, None);
                if peer.state.role == Role::Offerer && peer.state.committed_offer && self.leads(&peer_id) {
                    debug!(event = "negotiation_glare_offer_ignored", peer = %peer_id, "Remote offer collides with ours; keeping ours");
                    return Ok(());
                }
                if let Err(e) = peer.pc.set_remote_description(SessionDescription::offer(sdp)).await {
                    return Err(self.fail(&peer_id, NegotiationError::SetRemoteDescription(format!("{e:#}"))));
                }
                self.remote_description_applied(&peer_id, &mut peer).await;
                peer.state.role = Role::Answerer;
                let answer = match peer.pc.create_answer().await {
                    Ok(answer) => answer,
                    Err(e) => {
                        return Err(self.fail(&peer_id, NegotiationError::CreateAnswer(format!("{e:#}"))))
                    }
                };
                self.commit(&peer_id, &mut peer, answer).await
            }
            SignalingMessage::Answer { sdp } => {
                let shared = self.peer(&peer_id).await.map_err(|e| self.fail(&peer_id, e))?;
                let mut peer = shared.lock().await;
                self.progress(&peer_id, HandshakeStep::Answer, None);
                if let Err(e) = peer.pc.set_remote_description(SessionDescription::answer(sdp)).await {
                    return Err(self.fail(&peer_id, NegotiationError::SetRemoteDescription(format!("{e:#}"))));
                }
                self.remote_description_applied(&peer_id, &mut peer).await;
                Ok(())
            }
            SignalingMessage::Candidate { candidate } => {
                let shared = self.peer_or_create(&peer_id).await?;
                let pc = {
                    let mut peer = shared.lock().await;
                    if !peer.remote_description_set {
                        debug!(event = "candidate_queued", peer = %peer_id, queued = peer.pending_candidates.len() + 1, "Remote description not set yet");
                        peer.pending_candidates.push(candidate);
                        return Ok(());
                    }
                    peer.pc.clone()
                };
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    warn!(event = "candidate_rejected", peer = %peer_id, error = %e, "Failed to add ICE candidate");
                    return Err(NegotiationError::AddCandidate(format!("{e:#}")));
                }
                Ok(())
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Tie-break for simultaneous entry: the greater peer id leads.
    fn leads(&self, peer_id: &PeerId) -> bool {
        self.inner.local_id > *peer_id
    }

    /// Mark the remote description as set and apply queued candidates.
    async fn remote_description_applied(&self, peer_id: &PeerId, peer: &mut PeerNegotiation) {
        peer.remote_description_set = true;
        for candidate in std::mem::take(&mut peer.pending_candidates) {
            if let Err(e) = peer.pc.add_ice_candidate(candidate).await {
                warn!(event = "candidate_rejected", peer = %peer_id, error = %e, "Failed to add queued ICE candidate");
            }
        }
    }

    async fn offer(&self, peer_id: &PeerId, peer: &mut PeerNegotiation) -> Result<(), NegotiationError> {
        if peer.state.offer_attempted {
            debug!(event = "offer_skipped", peer = %peer_id, round = peer.state.round, "Offer already attempted this round");
            return Ok(());
        }
        peer.state.offer_attempted = true;
        peer.state.role = Role::Offerer;

        let offer = match peer.pc.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(peer_id, NegotiationError::CreateOffer(format!("{e:#}")))),
        };
        self.commit(peer_id, peer, offer).await
    }

    /// Transform, set locally, and send `description` unless that type was
    /// already committed for this peer connection.
    async fn commit(
        &self,
        peer_id: &PeerId,
        peer: &mut PeerNegotiation,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let kind = description.kind;
        if peer.state.is_committed(kind) {
            debug!(event = "description_already_set", peer = %peer_id, kind = kind.as_str(), "Ignoring repeated local description");
            return Ok(());
        }

        let settings = &self.inner.settings;
        let transformed = SessionDescription {
            kind,
            sdp: sdp::transform(&description.sdp, settings),
        };
        if let Err(e) = peer.pc.set_local_description(transformed.clone()).await {
            return Err(self.fail(peer_id, NegotiationError::SetLocalDescription(format!("{e:#}"))));
        }
        peer.state.commit(kind);
        info!(
            event = "local_description_set",
            peer = %peer_id,
            kind = kind.as_str(),
            stereo = settings.stereo,
            trickle = settings.ice_trickle,
            "Local description set"
        );
        self.progress(peer_id, step_for(kind), None);

        let outgoing = if settings.ice_trickle || kind == SdpType::Answer {
            transformed
        } else {
            debug!(event = "ice_gathering_wait", peer = %peer_id, "Waiting for ICE gathering before sending offer");
            match timeout(ICE_GATHER_TIMEOUT, peer.pc.gathering_complete()).await {
                Ok(Ok(gathered)) => gathered,
                Ok(Err(e)) => {
                    return Err(self.fail(peer_id, NegotiationError::IceGathering(format!("{e:#}"))))
                }
                Err(_) => {
                    return Err(self.fail(peer_id, NegotiationError::IceGathering("timed out".into())))
                }
            }
        };

        let message = match kind {
            SdpType::Offer => SignalingMessage::Offer { sdp: outgoing.sdp },
            SdpType::Answer => SignalingMessage::Answer { sdp: outgoing.sdp },
        };
        self.signal(Some(peer_id.clone()), message)
            .await
            .map_err(|e| self.fail(peer_id, e))
    }

    async fn signal(&self, target: Option<PeerId>, message: SignalingMessage) -> Result<(), NegotiationError> {
        let envelope = SignalingEnvelope {
            room_id: self.inner.settings.room_id.clone(),
            sender: self.inner.local_id.clone(),
            target,
            message,
        };
        self.inner
            .signaling
            .send(envelope)
            .await
            .map_err(|e| NegotiationError::Signaling(format!("{e:#}")))
    }

    fn progress(&self, peer_id: &PeerId, step: HandshakeStep, error: Option<NegotiationError>) {
        self.inner.events.publish(Event::HandshakeProgress(HandshakeProgress {
            peer_id: peer_id.clone(),
            step,
            error,
        }));
    }

    /// Surface a terminal failure for this attempt and hand the error back.
    fn fail(&self, peer_id: &PeerId, error: NegotiationError) -> NegotiationError {
        warn!(event = "negotiation_failed", peer = %peer_id, %error, "Handshake step failed");
        self.progress(peer_id, HandshakeStep::Error, Some(error.clone()));
        error
    }
}

fn step_for(kind: SdpType) -> HandshakeStep {
    match kind {
        SdpType::Offer => HandshakeStep::Offer,
        SdpType::Answer => HandshakeStep::Answer,
    }
}
