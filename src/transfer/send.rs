//! The sending half of a transfer.
//!
//! A `SendFileOperation` announces a summary of the selected items,
//! waits for the receiving side to call back, then streams chunks.
//! Chunk *n+1* is not produced until chunk *n* has been taken off the
//! channel — the capacity-1 channel is the acknowledgement point, so
//! chunks for one path can never overtake each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tonic::Status;

use crate::errors::TransferError;
use crate::events::{Event, EventBus};
use crate::proto::warp_client::WarpClient;
use crate::proto::{FileChunk, OpInfo, TransferOpRequest};
use crate::transfer::chunks::{summarize, ChunkIterator, TransferSelection};
use crate::transfer::{timestamp_now, Direction, OpStatus};

pub struct SendFileOperation {
    pub remote_uuid: String,
    pub timestamp: u64,
    pub total_size: u64,
    pub file_count: u64,
    pub top_dir_basenames: Vec<String>,
    selections: Vec<TransferSelection>,
    status: Mutex<OpStatus>,
    bytes_transferred: AtomicU64,
    events: EventBus,
}

impl SendFileOperation {
    pub fn new(
        remote_uuid: String,
        selections: Vec<TransferSelection>,
        events: EventBus,
    ) -> std::io::Result<Self> {
        let summary = summarize(&selections)?;
        Ok(Self {
            remote_uuid,
            timestamp: timestamp_now(),
            total_size: summary.total_size,
            file_count: summary.file_count,
            top_dir_basenames: summary.top_dir_basenames,
            selections,
            status: Mutex::new(OpStatus::Initializing),
            bytes_transferred: AtomicU64::new(0),
            events,
        })
    }

    pub fn status(&self) -> OpStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    fn set_status(&self, status: OpStatus) {
        {
            let mut current = self
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_terminal() && !matches!(status, OpStatus::WaitingForPermission) {
                return;
            }
            *current = status.clone();
        }
        self.events.publish(Event::TransferUpdated {
            uuid: self.remote_uuid.clone(),
            timestamp: self.timestamp,
            direction: Direction::Send,
            status,
            bytes_transferred: self.bytes_transferred(),
        });
    }

    fn op_info(&self, own_uuid: &str, readable_name: &str) -> OpInfo {
        OpInfo {
            ident: own_uuid.to_string(),
            timestamp: self.timestamp,
            readable_name: readable_name.to_string(),
            use_compression: false,
        }
    }

    /// Announce this operation to the peer and wait for permission.
    /// Streaming starts when the peer calls StartTransfer back.
    pub async fn request(
        &self,
        client: &mut WarpClient<Channel>,
        own_uuid: &str,
        sender_name: &str,
    ) -> Result<(), TransferError> {
        let single = (self.top_dir_basenames.len() == 1).then(|| self.top_dir_basenames[0].clone());
        let request = TransferOpRequest {
            info: Some(self.op_info(own_uuid, sender_name)),
            sender_name: sender_name.to_string(),
            size: self.total_size,
            count: self.file_count,
            name_if_single: single.clone().unwrap_or_default(),
            mime_if_single: single.map(|_| "application/octet-stream".to_string()).unwrap_or_default(),
            top_dir_basenames: self.top_dir_basenames.clone(),
        };

        client
            .process_transfer_op_request(request)
            .await
            .map_err(|e| TransferError::Unknown(e.to_string()))?;

        info!(
            "Requested transfer of {} item(s), {} bytes to {}",
            self.file_count, self.total_size, self.remote_uuid
        );
        self.set_status(OpStatus::WaitingForPermission);
        Ok(())
    }

    /// Start streaming chunks. The reader runs off the shared event
    /// loop on its own blocking task; the bounded channel makes it wait
    /// for each chunk to be taken before producing the next.
    pub fn open_stream(
        self: std::sync::Arc<Self>,
        chunk_size: usize,
    ) -> mpsc::Receiver<Result<FileChunk, Status>> {
        let (tx, rx) = mpsc::channel(1);
        self.set_status(OpStatus::Transferring);

        let op = self;
        tokio::task::spawn_blocking(move || {
            let mut iterator = ChunkIterator::with_chunk_size(&op.selections, chunk_size);
            loop {
                // Cooperative cancellation: a stop only takes effect at
                // a chunk boundary.
                if op.status() != OpStatus::Transferring {
                    debug!("Chunk stream for {} stopped early", op.timestamp);
                    iterator.close();
                    return;
                }

                let chunk = match iterator.next() {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        warn!("Read failure during transfer {}: {e}", op.timestamp);
                        let _ = tx.blocking_send(Err(Status::internal(e.to_string())));
                        op.set_status(OpStatus::Failed(e.to_string()));
                        iterator.close();
                        return;
                    }
                    None => break,
                };

                let payload = chunk.chunk.len() as u64;
                if tx.blocking_send(Ok(chunk)).is_err() {
                    // The peer dropped the stream mid-transfer.
                    if op.status() == OpStatus::Transferring {
                        op.set_status(OpStatus::Failed(
                            TransferError::ConnectionInterruption.to_string(),
                        ));
                    }
                    iterator.close();
                    return;
                }
                op.bytes_transferred.fetch_add(payload, Ordering::Relaxed);
            }

            op.set_status(OpStatus::Finished);
            info!(
                "Transfer {} finished, {} bytes sent",
                op.timestamp,
                op.bytes_transferred()
            );
        });

        rx
    }

    /// Cooperative local stop; takes effect at the next chunk boundary.
    pub fn cancel(&self) {
        self.set_status(OpStatus::Cancelled);
    }

    /// Remote stop with the error flag set, or a local failure.
    pub fn fail(&self, cause: TransferError) {
        self.set_status(OpStatus::Failed(cause.to_string()));
    }

    /// The peer declined the pending request.
    pub fn declined(&self) {
        self.set_status(OpStatus::Cancelled);
    }

    /// Re-offer a stopped operation: resets to WaitingForPermission.
    pub fn retry(&self) {
        self.bytes_transferred.store(0, Ordering::Relaxed);
        let mut current = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = OpStatus::WaitingForPermission;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn selection(dir: &std::path::Path, name: &str, contents: &[u8]) -> TransferSelection {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        TransferSelection::from_path(path).unwrap()
    }

    #[tokio::test]
    async fn finished_stream_accounts_for_every_byte() {
        let dir = tempdir().unwrap();
        let op = Arc::new(
            SendFileOperation::new(
                "PEER".into(),
                vec![
                    selection(dir.path(), "a.bin", &[1u8; 2048]),
                    selection(dir.path(), "b.bin", &[2u8; 100]),
                ],
                EventBus::default(),
            )
            .unwrap(),
        );
        assert_eq!(op.total_size, 2148);

        let mut rx = op.clone().open_stream(1024);
        let mut received = 0u64;
        while let Some(chunk) = rx.recv().await {
            received += chunk.unwrap().chunk.len() as u64;
        }

        assert_eq!(received, op.total_size);
        assert_eq!(op.bytes_transferred(), op.total_size);
        assert_eq!(op.status(), OpStatus::Finished);
    }

    #[tokio::test]
    async fn cancel_stops_the_stream_at_a_chunk_boundary() {
        let dir = tempdir().unwrap();
        let op = Arc::new(
            SendFileOperation::new(
                "PEER".into(),
                vec![selection(dir.path(), "big.bin", &[7u8; 8192])],
                EventBus::default(),
            )
            .unwrap(),
        );

        let mut rx = op.clone().open_stream(512);
        // Take one chunk, then cancel.
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.chunk.len(), 512);
        op.cancel();

        // The producer may already have one chunk in flight, but the
        // stream must end without delivering the whole file.
        let mut rest = 0u64;
        while let Some(chunk) = rx.recv().await {
            rest += chunk.unwrap().chunk.len() as u64;
        }
        assert!(rest + 512 < 8192, "stream kept going after cancel");
        assert_eq!(op.status(), OpStatus::Cancelled);
    }
}
