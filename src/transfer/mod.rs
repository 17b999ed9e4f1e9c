pub mod chunks;
pub mod receive;
pub mod send;
pub mod writer;

// Re-export key components for easier access
pub use chunks::{ChunkIterator, ItemKind, Summary, TransferSelection, CHUNK_SIZE};
pub use receive::ReceiveFileOperation;
pub use send::SendFileOperation;
pub use writer::Writer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use tokio::sync::Mutex;

use crate::errors::TransferError;

/// Wire values for FileChunk.file_type.
pub const FILE_TYPE_FILE: i32 = 1;
pub const FILE_TYPE_DIRECTORY: i32 = 2;
pub const FILE_TYPE_SYMLINK: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Lifecycle of a transfer operation. Transitions are monotonic except
/// for retry, which resets to WaitingForPermission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    Initializing,
    WaitingForPermission,
    Transferring,
    Finished,
    Cancelled,
    Failed(String),
}

impl OpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OpStatus::Finished | OpStatus::Cancelled | OpStatus::Failed(_)
        )
    }
}

/// Operation identity within one remote: the creation timestamp in
/// epoch milliseconds.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// All live transfer operations, keyed by (remote uuid, timestamp).
#[derive(Default)]
pub struct TransferRegistry {
    sends: Mutex<HashMap<(String, u64), Arc<SendFileOperation>>>,
    receives: Mutex<HashMap<(String, u64), Arc<ReceiveFileOperation>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_send(&self, op: Arc<SendFileOperation>) {
        self.sends
            .lock()
            .await
            .insert((op.remote_uuid.clone(), op.timestamp), op);
    }

    pub async fn register_receive(&self, op: Arc<ReceiveFileOperation>) {
        self.receives
            .lock()
            .await
            .insert((op.remote_uuid.clone(), op.timestamp), op);
    }

    pub async fn send_op(
        &self,
        remote_uuid: &str,
        timestamp: u64,
    ) -> Result<Arc<SendFileOperation>, TransferError> {
        self.sends
            .lock()
            .await
            .get(&(remote_uuid.to_string(), timestamp))
            .cloned()
            .ok_or(TransferError::NotFound(timestamp))
    }

    pub async fn receive_op(
        &self,
        remote_uuid: &str,
        timestamp: u64,
    ) -> Result<Arc<ReceiveFileOperation>, TransferError> {
        self.receives
            .lock()
            .await
            .get(&(remote_uuid.to_string(), timestamp))
            .cloned()
            .ok_or(TransferError::NotFound(timestamp))
    }

    /// Stop every non-terminal operation tied to a remote. Used on
    /// disconnect; the cause is always a connection interruption.
    pub async fn interrupt_remote(&self, remote_uuid: &str) {
        let mut stopped = 0usize;
        for op in self.sends.lock().await.values() {
            if op.remote_uuid == remote_uuid && !op.status().is_terminal() {
                op.fail(TransferError::ConnectionInterruption);
                stopped += 1;
            }
        }
        for op in self.receives.lock().await.values() {
            if op.remote_uuid == remote_uuid && !op.status().is_terminal() {
                op.fail(TransferError::ConnectionInterruption);
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!("Interrupted {stopped} active operation(s) for {remote_uuid}");
        }
    }

    /// Drop terminal operations so the registry does not grow without
    /// bound across many transfers. Called on a timer by the manager
    /// event loop.
    pub async fn prune(&self) {
        self.sends.lock().await.retain(|_, op| !op.status().is_terminal());
        self.receives
            .lock()
            .await
            .retain(|_, op| !op.status().is_terminal());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    #[tokio::test]
    async fn prune_drops_terminal_operations_and_keeps_live_ones() {
        let registry = TransferRegistry::new();
        let done = Arc::new(
            SendFileOperation::new("PEER-A".into(), vec![], EventBus::default()).unwrap(),
        );
        let live = Arc::new(
            SendFileOperation::new("PEER-B".into(), vec![], EventBus::default()).unwrap(),
        );
        registry.register_send(done.clone()).await;
        registry.register_send(live.clone()).await;
        done.cancel();

        registry.prune().await;
        assert!(registry.send_op("PEER-A", done.timestamp).await.is_err());
        assert!(registry.send_op("PEER-B", live.timestamp).await.is_ok());
    }
}
