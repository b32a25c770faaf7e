//! Loopback transfer: two coordinators joined by an in-memory channel pair.

use crate::core::config::Settings;
use crate::core::connection::memory;
use crate::core::events::{Event, EventBus, EventKind, Propagation, TransferEvent};
use crate::core::peer::PeerId;
use crate::core::transfer::{DataInfo, TransferCoordinator};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// How the loopback transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered { bytes: u64, output: Option<PathBuf> },
    Rejected,
}

pub async fn run(settings: &Settings, file: &Path, output: Option<PathBuf>, reject: bool) -> Result<Outcome> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string());

    let outcome = transfer(settings, Bytes::from(data), &name, reject).await?;
    if let (Some(path), Some(bytes)) = (&output, outcome.as_ref()) {
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(event = "loopback_written", path = %path.display(), size = bytes.len(), "Received copy written");
    }

    Ok(match outcome {
        Some(bytes) => Outcome::Delivered {
            bytes: bytes.len() as u64,
            output,
        },
        None => Outcome::Rejected,
    })
}

/// Send `data` from one in-process peer to another. Returns the received
/// bytes, or `None` when the receiver declined.
pub async fn transfer(settings: &Settings, data: Bytes, name: &str, reject: bool) -> Result<Option<Bytes>> {
    let (sender_id, receiver_id) = (PeerId::from("sender"), PeerId::from("receiver"));

    // Sender side reports through the bus; wait for its terminal event.
    let bus = Arc::new(EventBus::new());
    let (done_tx, done_rx) = oneshot::channel::<TransferEvent>();
    let done_tx = Mutex::new(Some(done_tx));
    bus.once(
        EventKind::DataTransferState,
        move |event| {
            if let Event::DataTransferState(state) = event {
                if let Some(tx) = done_tx.lock().ok().and_then(|mut slot| slot.take()) {
                    let _ = tx.send(state.clone());
                }
            }
            Propagation::Continue
        },
        Some(|event: &Event| matches!(event, Event::DataTransferState(state) if state.is_terminal())),
        false,
    );
    bus.on(EventKind::DataTransferState, |event| {
        if let Event::DataTransferState(TransferEvent::Uploading { percentage, .. }) = event {
            info!(event = "loopback_progress", percentage, "Uploading");
        }
        Propagation::Continue
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let sender = TransferCoordinator::new(sender_id.clone(), settings.transfer.clone(), bus.clone());
    let receiver = TransferCoordinator::new(receiver_id.clone(), settings.transfer.clone(), Arc::new(events_tx));

    let (a, b) = memory::pair("loopback");
    sender.connect(receiver_id.clone(), a.channel, a.inbound).await;
    receiver.connect(sender_id.clone(), b.channel, b.inbound).await;

    let transfer_id = sender
        .send_data(data, DataInfo::named(name), Some(receiver_id))
        .await?;
    info!(event = "loopback_started", transfer = %transfer_id, name, "Loopback transfer started");

    let mut received = None;
    while let Some(event) = events_rx.recv().await {
        let Event::DataTransferState(state) = event else { continue };
        match state {
            TransferEvent::UploadRequest { peer_id, size, .. } => {
                info!(event = "loopback_request", size, accept = !reject, "Upload request received");
                receiver.respond_request(&peer_id, !reject).await?;
                if reject {
                    break;
                }
            }
            TransferEvent::DownloadCompleted { data, .. } => {
                received = Some(data);
                break;
            }
            TransferEvent::Failed { error, .. } => bail!("Receiver failed: {error}"),
            TransferEvent::Cancelled { message, .. } => bail!("Transfer cancelled: {message}"),
            _ => {}
        }
    }

    match done_rx.await.map_err(|_| anyhow!("Sender finished without a terminal event"))? {
        TransferEvent::UploadCompleted { .. } => Ok(received),
        TransferEvent::Rejected { .. } => Ok(None),
        TransferEvent::Failed { error, .. } => Err(anyhow!("Sender failed: {error}")),
        other => Err(anyhow!("Unexpected sender outcome: {other:?}")),
    }
}
