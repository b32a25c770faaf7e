//! Per-(peer, direction) transfer state and the registry that owns it.

use crate::core::peer::{PeerId, SessionKey};
use crate::core::protocol::{ChunkAssembler, ChunkSet, WriteRequest};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upload: WRQ sent, waiting for ACK(0) or ACK(-1).
    Requested,
    /// Upload: accepted, one chunk in flight per ACK.
    Sending,
    /// Download: WRQ received, waiting for the local accept/reject.
    RequestReceived,
    /// Download: accepted, each chunk answered with the next ACK.
    Receiving,
    /// Torn down. The registry entry is gone or about to be.
    Retired,
}

#[derive(Debug)]
pub enum SessionPayload {
    Outgoing(ChunkSet),
    Incoming(ChunkAssembler),
    Released,
}

#[derive(Debug)]
pub struct TransferSession {
    pub transfer_id: Uuid,
    pub key: SessionKey,
    pub name: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub chunk_count: u64,
    pub timeout_secs: u64,
    /// Upload: last ACK acted on. Download: last ACK sent.
    pub ack_sequence: u64,
    pub bytes_transferred: u64,
    pub state: SessionState,
    pub payload: SessionPayload,
}

impl TransferSession {
    pub fn outgoing(
        transfer_id: Uuid,
        peer_id: PeerId,
        name: String,
        chunks: ChunkSet,
        chunk_size: usize,
        timeout_secs: u64,
    ) -> Self {
        Self {
            transfer_id,
            key: SessionKey::upload(peer_id),
            name,
            total_size: chunks.total_size(),
            chunk_size,
            chunk_count: chunks.len(),
            timeout_secs,
            ack_sequence: 0,
            bytes_transferred: 0,
            state: SessionState::Requested,
            payload: SessionPayload::Outgoing(chunks),
        }
    }

    pub fn incoming(transfer_id: Uuid, peer_id: PeerId, request: &WriteRequest) -> Self {
        Self {
            transfer_id,
            key: SessionKey::download(peer_id),
            name: request.name.clone(),
            total_size: request.size,
            chunk_size: request.chunk_size,
            chunk_count: request.chunk_count,
            timeout_secs: request.timeout,
            ack_sequence: 0,
            bytes_transferred: 0,
            state: SessionState::RequestReceived,
            payload: SessionPayload::Incoming(ChunkAssembler::new(
                request.size,
                request.chunk_size,
                request.chunk_count,
            )),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.key.peer_id
    }

    pub fn is_retired(&self) -> bool {
        self.state == SessionState::Retired
    }

    pub fn retire(&mut self) {
        self.state = SessionState::Retired;
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn percentage(&self) -> u8 {
        if self.total_size == 0 {
            return 100;
        }
        (self.bytes_transferred.saturating_mul(100) / self.total_size).min(100) as u8
    }

    /// The upload ACK this session will act on next.
    pub fn expected_ack(&self) -> Option<u64> {
        match self.state {
            SessionState::Requested => Some(0),
            SessionState::Sending => Some(self.ack_sequence + 1),
            _ => None,
        }
    }

    pub fn chunk(&self, index: u64) -> Option<Bytes> {
        match &self.payload {
            SessionPayload::Outgoing(chunks) => chunks.get(index).cloned(),
            _ => None,
        }
    }

    pub fn assembler_mut(&mut self) -> Option<&mut ChunkAssembler> {
        match &mut self.payload {
            SessionPayload::Incoming(assembler) => Some(assembler),
            _ => None,
        }
    }

    /// Release the payload buffers, returning the reassembled bytes for a
    /// download.
    pub fn release(&mut self) -> Option<Bytes> {
        match std::mem::replace(&mut self.payload, SessionPayload::Released) {
            SessionPayload::Incoming(assembler) => Some(assembler.assemble()),
            _ => None,
        }
    }
}

pub type SharedSession = Arc<Mutex<TransferSession>>;

/// Owns every live session, at most one per [`SessionKey`].
///
/// The map lock is only held for lookup, insert and remove; per-session
/// mutation happens under the session's own mutex so unrelated keys never
/// wait on each other.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, SharedSession>>,
}

impl SessionRegistry {
    pub async fn get(&self, key: &SessionKey) -> Option<SharedSession> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Insert `session` already locked, so no inbound handler can observe it
    /// before the caller finishes setting it up. Returns the existing entry
    /// if the key is taken.
    pub async fn insert_locked(
        &self,
        session: TransferSession,
    ) -> Result<OwnedMutexGuard<TransferSession>, SharedSession> {
        let key = session.key.clone();
        let shared = Arc::new(Mutex::new(session));
        let guard = shared.clone().lock_owned().await;

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&key) {
            return Err(existing.clone());
        }
        sessions.insert(key, shared);
        Ok(guard)
    }

    /// Remove `key` only if it still maps to `session`.
    pub async fn remove_if(&self, key: &SessionKey, session: &SharedSession) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    pub async fn for_peer(&self, peer_id: &PeerId) -> Vec<(SessionKey, SharedSession)> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(key, _)| &key.peer_id == peer_id)
            .map(|(key, session)| (key.clone(), session.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(peer: &str, size: usize) -> TransferSession {
        let data = Bytes::from(vec![7u8; size]);
        TransferSession::outgoing(
            Uuid::new_v4(),
            PeerId::from(peer),
            "f".into(),
            ChunkSet::slice(&data, 4),
            4,
            5,
        )
    }

    #[tokio::test]
    async fn one_session_per_key() {
        let registry = SessionRegistry::default();
        let guard = registry.insert_locked(upload("bob", 9)).await.unwrap();
        drop(guard);

        assert!(registry.insert_locked(upload("bob", 3)).await.is_err());
        assert!(registry.insert_locked(upload("carol", 3)).await.is_ok());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn remove_if_ignores_replaced_session() {
        let registry = SessionRegistry::default();
        let key = SessionKey::upload(PeerId::from("bob"));
        drop(registry.insert_locked(upload("bob", 9)).await.unwrap());
        let first = registry.get(&key).await.unwrap();

        assert!(registry.remove_if(&key, &first).await);
        drop(registry.insert_locked(upload("bob", 9)).await.unwrap());

        assert!(!registry.remove_if(&key, &first).await);
        assert!(registry.get(&key).await.is_some());
    }

    #[test]
    fn expected_ack_follows_state() {
        let mut session = upload("bob", 9);
        assert_eq!(session.chunk_count, 3);
        assert_eq!(session.expected_ack(), Some(0));

        session.state = SessionState::Sending;
        session.ack_sequence = 1;
        assert_eq!(session.expected_ack(), Some(2));

        session.retire();
        assert_eq!(session.expected_ack(), None);
    }

    #[test]
    fn empty_payload_reports_full_progress() {
        let session = upload("bob", 0);
        assert_eq!(session.chunk_count, 0);
        assert_eq!(session.percentage(), 100);
    }
}
