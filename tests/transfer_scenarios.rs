//! End-to-end transfer scenarios between coordinators whose frames are
//! shuttled by hand, so every WRQ, ACK and chunk can be observed.

use bytes::Bytes;
use meshdrop::core::config::{ChunkEncoding, TransferSettings};
use meshdrop::core::connection::{memory, ChannelPayload};
use meshdrop::core::protocol::{decode, ControlMessage, Inbound};
use meshdrop::core::transfer::{DataInfo, SessionState, TransferCoordinator};
use meshdrop::core::{Direction, Event, PeerId, TransferError};
use meshdrop::core::events::TransferEvent;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver};

// ── Harness ──────────────────────────────────────────────────────────────────

struct Node {
    id: PeerId,
    coordinator: TransferCoordinator,
    events: UnboundedReceiver<Event>,
    outbound: HashMap<PeerId, UnboundedReceiver<ChannelPayload>>,
}

impl Node {
    fn new(id: &str, chunk_size: usize, encoding: ChunkEncoding) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let settings = TransferSettings {
            chunk_size,
            timeout_secs: 30,
            encoding,
        };
        let id = PeerId::from(id);
        Self {
            coordinator: TransferCoordinator::new(id.clone(), settings, std::sync::Arc::new(tx)),
            id,
            events,
            outbound: HashMap::new(),
        }
    }

    async fn link(&mut self, peer: &PeerId) {
        let (near, far) = memory::pair("data");
        self.coordinator.register_channel(peer.clone(), near.channel).await;
        self.outbound.insert(peer.clone(), far.inbound);
    }

    fn next_frame(&mut self, peer: &PeerId) -> Option<ChannelPayload> {
        self.outbound.get_mut(peer)?.try_recv().ok()
    }

    fn transfer_events(&mut self) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let Event::DataTransferState(state) = event {
                out.push(state);
            }
        }
        out
    }

    /// Inject a frame as if `from` had sent it.
    async fn receive(&self, from: &PeerId, payload: ChannelPayload) {
        self.coordinator.handle_inbound(from, payload).await;
    }
}

async fn linked(a: &str, b: &str, chunk_size: usize, encoding: ChunkEncoding) -> (Node, Node) {
    let mut a = Node::new(a, chunk_size, encoding);
    let mut b = Node::new(b, chunk_size, encoding);
    a.link(&b.id.clone()).await;
    b.link(&a.id.clone()).await;
    (a, b)
}

/// Move one pending frame from `from` to `to`.
async fn deliver(from: &mut Node, to: &Node) -> Option<ChannelPayload> {
    let frame = from.next_frame(&to.id)?;
    to.receive(&from.id, frame.clone()).await;
    Some(frame)
}

/// Shuttle frames both ways until neither side has anything to send.
/// Returns every frame with its sender.
async fn settle(a: &mut Node, b: &mut Node) -> Vec<(PeerId, ChannelPayload)> {
    let mut log = Vec::new();
    loop {
        let mut moved = false;
        while let Some(frame) = deliver(a, b).await {
            log.push((a.id.clone(), frame));
            moved = true;
        }
        while let Some(frame) = deliver(b, a).await {
            log.push((b.id.clone(), frame));
            moved = true;
        }
        if !moved {
            return log;
        }
    }
}

fn control(frame: &ChannelPayload) -> Option<ControlMessage> {
    match decode(frame.clone()) {
        Inbound::Control(message) => Some(message),
        _ => None,
    }
}

fn acks(log: &[(PeerId, ChannelPayload)]) -> Vec<i64> {
    log.iter()
        .filter_map(|(_, frame)| match control(frame) {
            Some(ControlMessage::Ack(ack)) => Some(ack.ack_n),
            _ => None,
        })
        .collect()
}

fn ack(n: i64, sender: &str) -> ChannelPayload {
    ChannelPayload::Text(json!({"type": "ACK", "ackN": n, "sender": sender}).to_string())
}

/// Start an upload from `a` to `b` and accept it on `b`.
async fn start_accepted(a: &mut Node, b: &mut Node, data: &'static [u8]) {
    a.coordinator
        .send_data(Bytes::from_static(data), DataInfo::named("payload.bin"), Some(b.id.clone()))
        .await
        .unwrap();
    deliver(a, b).await.expect("WRQ");
    b.coordinator.respond_request(&a.id, true).await.unwrap();
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_request_ends_both_sides() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    alice
        .coordinator
        .send_data(Bytes::from_static(b"hello"), DataInfo::named("f"), Some(bob.id.clone()))
        .await
        .unwrap();
    deliver(&mut alice, &bob).await.expect("WRQ");

    bob.coordinator.respond_request(&alice.id, false).await.unwrap();
    let log = settle(&mut alice, &mut bob).await;

    assert_eq!(acks(&log), vec![-1]);
    assert!(alice.transfer_events().iter().any(|e| matches!(
        e,
        TransferEvent::Rejected { direction: Direction::Upload, .. }
    )));
    assert!(bob.transfer_events().iter().any(|e| matches!(
        e,
        TransferEvent::Rejected { direction: Direction::Download, .. }
    )));
    assert_eq!(alice.coordinator.active_sessions().await, 0);
    assert_eq!(bob.coordinator.active_sessions().await, 0);
}

#[tokio::test]
async fn nine_bytes_in_four_byte_chunks() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    start_accepted(&mut alice, &mut bob, b"abcdefghi").await;
    let log = settle(&mut alice, &mut bob).await;

    let chunk_lens: Vec<usize> = log
        .iter()
        .filter_map(|(sender, frame)| match frame {
            ChannelPayload::Binary(data) if *sender == alice.id => Some(data.len()),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_lens, vec![4, 4, 1]);
    // One acceptance plus one ACK per chunk, the last one included.
    assert_eq!(acks(&log), vec![0, 1, 2, 3]);

    let received = bob.transfer_events().into_iter().find_map(|e| match e {
        TransferEvent::DownloadCompleted { data, .. } => Some(data),
        _ => None,
    });
    assert_eq!(received, Some(Bytes::from_static(b"abcdefghi")));
    assert!(alice
        .transfer_events()
        .iter()
        .any(|e| matches!(e, TransferEvent::UploadCompleted { .. })));
    assert_eq!(alice.coordinator.armed_timeouts(), 0);
    assert_eq!(bob.coordinator.armed_timeouts(), 0);
}

#[tokio::test]
async fn exact_multiple_of_chunk_size() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    start_accepted(&mut alice, &mut bob, b"abcdefgh").await;
    let log = settle(&mut alice, &mut bob).await;

    assert_eq!(acks(&log), vec![0, 1, 2]);
    let received = bob.transfer_events().into_iter().find_map(|e| match e {
        TransferEvent::DownloadCompleted { data, .. } => Some(data),
        _ => None,
    });
    assert_eq!(received, Some(Bytes::from_static(b"abcdefgh")));
}

#[tokio::test]
async fn empty_payload_completes_on_acceptance() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    alice
        .coordinator
        .send_data(Bytes::new(), DataInfo::named("empty"), Some(bob.id.clone()))
        .await
        .unwrap();
    let wrq = deliver(&mut alice, &bob).await.expect("WRQ");
    match control(&wrq) {
        Some(ControlMessage::Wrq(wrq)) => {
            assert_eq!(wrq.size, 0);
            assert_eq!(wrq.chunk_count, 0);
        }
        other => panic!("expected WRQ, got {other:?}"),
    }

    bob.coordinator.respond_request(&alice.id, true).await.unwrap();
    let log = settle(&mut alice, &mut bob).await;

    assert_eq!(acks(&log), vec![0]);
    assert!(bob.transfer_events().iter().any(|e| matches!(
        e,
        TransferEvent::DownloadCompleted { data, .. } if data.is_empty()
    )));
    assert!(alice
        .transfer_events()
        .iter()
        .any(|e| matches!(e, TransferEvent::UploadCompleted { .. })));
}

#[tokio::test]
async fn base64_frames_deliver_raw_bytes() {
    let (mut alice, mut bob) = linked("alice", "bob", 5, ChunkEncoding::Base64).await;
    start_accepted(&mut alice, &mut bob, &[0, 1, 2, 250, 251, 252, 253, 254, 255]).await;
    let log = settle(&mut alice, &mut bob).await;

    assert!(log
        .iter()
        .all(|(_, frame)| matches!(frame, ChannelPayload::Text(_))));
    assert_eq!(acks(&log), vec![0, 1, 2]);
    let received = bob.transfer_events().into_iter().find_map(|e| match e {
        TransferEvent::DownloadCompleted { data, .. } => Some(data),
        _ => None,
    });
    assert_eq!(received.as_deref(), Some(&[0u8, 1, 2, 250, 251, 252, 253, 254, 255][..]));
}

#[tokio::test(start_paused = true)]
async fn silent_receiver_times_out_and_late_ack_is_ignored() {
    let (mut alice, bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    let info = DataInfo {
        name: "slow".into(),
        timeout_secs: Some(1),
    };
    alice
        .coordinator
        .send_data(Bytes::from_static(b"abcdefghi"), info, Some(bob.id.clone()))
        .await
        .unwrap();
    assert!(matches!(control(&alice.next_frame(&bob.id).unwrap()), Some(ControlMessage::Wrq(_))));

    // The paused clock advances to the deadline while we wait.
    let failed = loop {
        match alice.events.recv().await {
            Some(Event::DataTransferState(event @ TransferEvent::Failed { .. })) => break event,
            Some(_) => continue,
            None => panic!("event stream closed"),
        }
    };
    assert!(matches!(
        failed,
        TransferEvent::Failed { error: TransferError::Timeout { seconds: 1 }, direction: Direction::Upload, .. }
    ));

    match control(&alice.next_frame(&bob.id).expect("timeout ERROR")) {
        Some(ControlMessage::Error(notice)) => {
            assert_eq!(
                notice.content,
                "Connection Timeout. Longer than 1 seconds. Connection is abolished."
            );
            assert!(notice.is_upload_error);
        }
        other => panic!("expected ERROR, got {other:?}"),
    }

    alice.receive(&bob.id, ack(0, "bob")).await;
    assert!(alice.next_frame(&bob.id).is_none());
    assert!(alice.transfer_events().is_empty());
    assert_eq!(alice.coordinator.active_sessions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn accepted_download_times_out_and_late_chunk_is_ignored() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    let info = DataInfo {
        name: "slow".into(),
        timeout_secs: Some(1),
    };
    alice
        .coordinator
        .send_data(Bytes::from_static(b"abcdefghi"), info, Some(bob.id.clone()))
        .await
        .unwrap();
    deliver(&mut alice, &bob).await.expect("WRQ");
    bob.coordinator.respond_request(&alice.id, true).await.unwrap();
    assert_eq!(
        bob.coordinator.session_state(&alice.id, Direction::Download).await,
        Some(SessionState::Receiving)
    );

    // No chunk ever arrives; the paused clock runs to the deadline.
    let failed = loop {
        match bob.events.recv().await {
            Some(Event::DataTransferState(event @ TransferEvent::Failed { .. })) => break event,
            Some(_) => continue,
            None => panic!("event stream closed"),
        }
    };
    assert!(matches!(
        failed,
        TransferEvent::Failed { error: TransferError::Timeout { seconds: 1 }, direction: Direction::Download, .. }
    ));

    let notice = std::iter::from_fn(|| bob.next_frame(&alice.id))
        .find_map(|frame| match control(&frame) {
            Some(ControlMessage::Error(notice)) => Some(notice),
            _ => None,
        })
        .expect("timeout ERROR");
    assert!(!notice.is_upload_error);
    assert_eq!(bob.coordinator.active_sessions().await, 0);

    bob.receive(&alice.id, ChannelPayload::Binary(Bytes::from_static(b"abcd")))
        .await;
    assert!(bob.next_frame(&alice.id).is_none());
    assert!(bob.transfer_events().is_empty());
    assert_eq!(bob.coordinator.active_sessions().await, 0);
}

#[tokio::test]
async fn cancel_after_completion_is_a_no_op() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    start_accepted(&mut alice, &mut bob, b"abcdefghi").await;
    settle(&mut alice, &mut bob).await;
    assert!(bob
        .transfer_events()
        .iter()
        .any(|e| matches!(e, TransferEvent::DownloadCompleted { .. })));
    assert!(alice
        .transfer_events()
        .iter()
        .any(|e| matches!(e, TransferEvent::UploadCompleted { .. })));

    let local = bob
        .coordinator
        .cancel_transfer(&alice.id, Direction::Download, "too late")
        .await;
    assert!(matches!(local, Err(TransferError::UnknownSession { .. })));
    assert!(bob.next_frame(&alice.id).is_none());

    let remote = json!({"type": "CANCEL", "name": "payload.bin", "content": "too late", "isUploadError": false, "sender": "bob"});
    alice.receive(&bob.id, ChannelPayload::Text(remote.to_string())).await;
    assert!(alice.next_frame(&bob.id).is_none());
    assert!(alice.transfer_events().is_empty());
    assert!(bob.transfer_events().is_empty());
    assert_eq!(alice.coordinator.active_sessions().await, 0);
    assert_eq!(bob.coordinator.active_sessions().await, 0);
}

#[tokio::test]
async fn receiver_cancel_mid_transfer() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    start_accepted(&mut alice, &mut bob, b"abcdefghi").await;

    deliver(&mut bob, &alice).await.expect("ACK 0");
    deliver(&mut alice, &bob).await.expect("chunk 0");
    bob.coordinator
        .cancel_transfer(&alice.id, Direction::Download, "user stopped")
        .await
        .unwrap();
    let log = settle(&mut alice, &mut bob).await;

    assert!(log
        .iter()
        .all(|(_, frame)| !matches!(control(frame), Some(ControlMessage::Error(_)))));
    assert!(bob.transfer_events().iter().any(|e| matches!(
        e,
        TransferEvent::Cancelled { direction: Direction::Download, cancelled_by, .. } if cancelled_by.as_str() == "bob"
    )));
    let cancelled = alice.transfer_events().into_iter().find_map(|e| match e {
        TransferEvent::Cancelled { direction, cancelled_by, message, .. } => Some((direction, cancelled_by, message)),
        _ => None,
    });
    assert_eq!(
        cancelled,
        Some((Direction::Upload, PeerId::from("bob"), "user stopped".to_string()))
    );
    assert_eq!(alice.coordinator.active_sessions().await, 0);
    assert_eq!(bob.coordinator.active_sessions().await, 0);
}

#[tokio::test]
async fn oversized_chunk_aborts_with_size_mismatch() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    start_accepted(&mut alice, &mut bob, b"abcdefghi").await;
    bob.next_frame(&alice.id).expect("ACK 0");

    bob.receive(&alice.id, ChannelPayload::Binary(Bytes::from_static(b"abcde"))).await;

    match control(&bob.next_frame(&alice.id).expect("ERROR")) {
        Some(ControlMessage::Error(notice)) => assert!(!notice.is_upload_error),
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert!(bob.transfer_events().iter().any(|e| matches!(
        e,
        TransferEvent::Failed { error: TransferError::SizeMismatch { expected: 4, actual: 5 }, .. }
    )));
    assert_eq!(bob.coordinator.active_sessions().await, 0);
}

#[tokio::test]
async fn stale_and_future_acks_are_ignored() {
    let (mut alice, bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    alice
        .coordinator
        .send_data(Bytes::from_static(b"abcdefghi"), DataInfo::named("f"), Some(bob.id.clone()))
        .await
        .unwrap();
    alice.next_frame(&bob.id).expect("WRQ");

    alice.receive(&bob.id, ack(0, "bob")).await;
    assert!(matches!(alice.next_frame(&bob.id), Some(ChannelPayload::Binary(_))));

    alice.receive(&bob.id, ack(0, "bob")).await;
    alice.receive(&bob.id, ack(3, "bob")).await;
    alice.receive(&bob.id, ack(-1, "bob")).await;
    assert!(alice.next_frame(&bob.id).is_none());
    assert_eq!(
        alice.coordinator.session_state(&bob.id, Direction::Upload).await,
        Some(SessionState::Sending)
    );
}

#[tokio::test]
async fn broadcast_shares_one_transfer_id() {
    let mut alice = Node::new("alice", 4, ChunkEncoding::Binary);
    let mut bob = Node::new("bob", 4, ChunkEncoding::Binary);
    let mut carol = Node::new("carol", 4, ChunkEncoding::Binary);
    alice.link(&bob.id.clone()).await;
    alice.link(&carol.id.clone()).await;
    bob.link(&alice.id.clone()).await;
    carol.link(&alice.id.clone()).await;

    let transfer_id = alice
        .coordinator
        .send_data(Bytes::from_static(b"abcdef"), DataInfo::named("all"), None)
        .await
        .unwrap();
    for peer in [&mut bob, &mut carol] {
        deliver(&mut alice, peer).await.expect("WRQ");
        peer.coordinator.respond_request(&alice.id, true).await.unwrap();
        settle(&mut alice, peer).await;
    }

    let events = alice.transfer_events();
    assert!(matches!(
        events.first(),
        Some(TransferEvent::UploadStarted { peer_ids, .. }) if peer_ids.len() == 2
    ));
    let completed: Vec<&PeerId> = events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::UploadCompleted { peer_id, .. } => Some(peer_id),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![&bob.id, &carol.id]);
    assert!(events.iter().all(|e| e.transfer_id() == transfer_id));
}

#[tokio::test]
async fn second_upload_to_busy_peer_is_refused() {
    let (alice, bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    alice
        .coordinator
        .send_data(Bytes::from_static(b"one"), DataInfo::named("a"), Some(bob.id.clone()))
        .await
        .unwrap();

    let second = alice
        .coordinator
        .send_data(Bytes::from_static(b"two"), DataInfo::named("b"), Some(bob.id.clone()))
        .await;
    assert_eq!(
        second,
        Err(TransferError::SessionBusy {
            peer_id: bob.id.clone(),
            direction: Direction::Upload
        })
    );
}

#[tokio::test]
async fn repeated_wrq_supersedes_pending_download() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    let wrq = json!({"type": "WRQ", "name": "f", "size": 3, "chunkSize": 4, "chunkCount": 1, "timeout": 5, "sender": "alice"});
    bob.receive(&alice.id, ChannelPayload::Text(wrq.to_string())).await;
    bob.receive(&alice.id, ChannelPayload::Text(wrq.to_string())).await;

    let events = bob.transfer_events();
    assert!(matches!(
        events.as_slice(),
        [
            TransferEvent::UploadRequest { .. },
            TransferEvent::Failed { error: TransferError::Superseded, .. },
            TransferEvent::UploadRequest { .. },
        ]
    ));
    assert_ne!(events[0].transfer_id(), events[2].transfer_id());
    assert_eq!(bob.coordinator.active_sessions().await, 1);
    assert_eq!(bob.coordinator.armed_timeouts(), 1);
    assert!(alice.transfer_events().is_empty());
}

#[tokio::test]
async fn messages_reach_the_peer_and_echo_locally() {
    let (mut alice, mut bob) = linked("alice", "bob", 4, ChunkEncoding::Binary).await;
    alice
        .coordinator
        .send_message(json!({"text": "hi"}), Some(bob.id.clone()))
        .await
        .unwrap();
    settle(&mut alice, &mut bob).await;

    match alice.events.try_recv() {
        Ok(Event::IncomingMessage(msg)) => assert!(msg.is_self && msg.is_private),
        other => panic!("expected local echo, got {other:?}"),
    }
    match bob.events.try_recv() {
        Ok(Event::IncomingMessage(msg)) => {
            assert!(!msg.is_self);
            assert_eq!(msg.sender_peer_id, alice.id);
            assert_eq!(msg.content, json!({"text": "hi"}));
        }
        other => panic!("expected message, got {other:?}"),
    }
}
