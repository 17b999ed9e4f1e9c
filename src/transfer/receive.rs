//! The receiving half of a transfer.
//!
//! Registered when a peer announces a transfer; verifies free space
//! before anything touches the disk, then consumes the chunk stream and
//! drives writer rollover. Cancellation from either side lands at a
//! chunk boundary and discards partial writes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{info, warn};
use sysinfo::Disks;
use tonic::transport::Channel;

use crate::errors::{SinkError, TransferError};
use crate::events::{Event, EventBus};
use crate::proto::warp_client::WarpClient;
use crate::proto::{OpInfo, StopInfo, TransferOpRequest};
use crate::transfer::writer::LandingArea;
use crate::transfer::{Direction, OpStatus};

pub struct ReceiveFileOperation {
    pub remote_uuid: String,
    pub timestamp: u64,
    pub sender_name: String,
    pub total_size: u64,
    pub file_count: u64,
    pub top_dir_basenames: Vec<String>,
    save_dir: PathBuf,
    overwrite: bool,
    status: Mutex<OpStatus>,
    bytes_transferred: AtomicU64,
    events: EventBus,
}

impl ReceiveFileOperation {
    pub fn new(
        remote_uuid: String,
        request: &TransferOpRequest,
        save_dir: PathBuf,
        overwrite: bool,
        events: EventBus,
    ) -> Self {
        let timestamp = request.info.as_ref().map(|i| i.timestamp).unwrap_or_default();
        Self {
            remote_uuid,
            timestamp,
            sender_name: request.sender_name.clone(),
            total_size: request.size,
            file_count: request.count,
            top_dir_basenames: request.top_dir_basenames.clone(),
            save_dir,
            overwrite,
            status: Mutex::new(OpStatus::Initializing),
            bytes_transferred: AtomicU64::new(0),
            events,
        }
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
            if current.is_terminal() {
                return;
            }
            *current = status.clone();
        }
        self.events.publish(Event::TransferUpdated {
            uuid: self.remote_uuid.clone(),
            timestamp: self.timestamp,
            direction: Direction::Receive,
            status,
            bytes_transferred: self.bytes_transferred(),
        });
    }

    /// Verify the destination volume can hold the advertised size, then
    /// move to WaitingForPermission. Failing the space check is
    /// terminal: no writer is ever created and streaming never starts.
    pub fn initialize(&self) -> Result<(), SinkError> {
        if let Some(available) = available_space(&self.save_dir) {
            if available < self.total_size {
                warn!(
                    "Rejecting transfer {}: need {} bytes, {} available",
                    self.timestamp, self.total_size, available
                );
                let err = SinkError::SpaceUnavailable {
                    needed: self.total_size,
                    available,
                };
                self.set_status(OpStatus::Failed(err.to_string()));
                return Err(err);
            }
        } else {
            warn!(
                "Could not determine free space for {}, accepting optimistically",
                self.save_dir.display()
            );
        }
        self.set_status(OpStatus::WaitingForPermission);
        self.events.publish(Event::TransferRequested {
            uuid: self.remote_uuid.clone(),
            timestamp: self.timestamp,
            sender_name: self.sender_name.clone(),
            total_size: self.total_size,
        });
        Ok(())
    }

    /// A repeated announcement for the same timestamp is a retry, not a
    /// new operation: reset progress and re-run the space check.
    pub fn reinitialize(&self) -> Result<(), SinkError> {
        info!("Transfer {} re-announced by peer, reinitializing", self.timestamp);
        self.bytes_transferred.store(0, Ordering::Relaxed);
        {
            let mut current = self
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = OpStatus::Initializing;
        }
        self.initialize()
    }

    fn op_info(&self, own_uuid: &str) -> OpInfo {
        OpInfo {
            ident: own_uuid.to_string(),
            timestamp: self.timestamp,
            readable_name: self.sender_name.clone(),
            use_compression: false,
        }
    }

    /// Accept the pending transfer: ask the sender to start streaming
    /// and consume chunks until the stream ends or the operation is
    /// stopped. Cancellation is checked between chunks.
    pub async fn accept(
        &self,
        mut client: WarpClient<Channel>,
        own_uuid: &str,
    ) -> Result<(), TransferError> {
        if self.status() != OpStatus::WaitingForPermission {
            return Err(TransferError::Unknown(
                "operation is not waiting for permission".into(),
            ));
        }
        self.set_status(OpStatus::Transferring);

        let mut stream = match client.start_transfer(self.op_info(own_uuid)).await {
            Ok(response) => response.into_inner(),
            Err(e) => {
                warn!("Could not start transfer {}: {e}", self.timestamp);
                self.set_status(OpStatus::Failed(
                    TransferError::ConnectionInterruption.to_string(),
                ));
                return Err(TransferError::ConnectionInterruption);
            }
        };

        let mut landing = LandingArea::new();
        loop {
            if self.status() != OpStatus::Transferring {
                // Stopped locally or by the peer between chunks.
                landing.fail();
                return Err(TransferError::Cancelled);
            }

            let chunk = match stream.message().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    warn!("Stream failure during transfer {}: {e}", self.timestamp);
                    landing.fail();
                    self.set_status(OpStatus::Failed(
                        TransferError::ConnectionInterruption.to_string(),
                    ));
                    return Err(TransferError::ConnectionInterruption);
                }
            };

            match landing.apply(&chunk, &self.save_dir, self.overwrite) {
                Ok(written) => {
                    self.bytes_transferred.fetch_add(written, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Write failure during transfer {}: {e}", self.timestamp);
                    landing.fail();
                    self.set_status(OpStatus::Failed(e.to_string()));
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = landing.finish() {
            self.set_status(OpStatus::Failed(e.to_string()));
            return Err(e.into());
        }

        let received = self.bytes_transferred();
        if received == self.total_size {
            self.set_status(OpStatus::Finished);
            info!(
                "Transfer {} finished, {received} bytes received into {}",
                self.timestamp,
                self.save_dir.display()
            );
            Ok(())
        } else {
            self.set_status(OpStatus::Failed(
                TransferError::ConnectionInterruption.to_string(),
            ));
            Err(TransferError::ConnectionInterruption)
        }
    }

    /// Decline a pending request: inform the sender, then mark
    /// cancelled locally.
    pub async fn decline(&self, mut client: WarpClient<Channel>, own_uuid: &str) {
        if let Err(e) = client.cancel_transfer_op_request(self.op_info(own_uuid)).await {
            warn!("Could not notify peer of declined transfer: {e}");
        }
        self.set_status(OpStatus::Cancelled);
    }

    /// Stop a transfer in flight: inform the sender, then cancel. The
    /// accept loop notices at the next chunk boundary and discards
    /// partial writes.
    pub async fn stop(&self, mut client: WarpClient<Channel>, own_uuid: &str, error: bool) {
        let stop = StopInfo {
            info: Some(self.op_info(own_uuid)),
            error,
        };
        if let Err(e) = client.stop_transfer(stop).await {
            warn!("Could not notify peer of stopped transfer: {e}");
        }
        self.set_status(OpStatus::Cancelled);
    }

    /// The peer cancelled or stopped from its side.
    pub fn handle_remote_stop(&self, error: bool) {
        if error {
            self.set_status(OpStatus::Failed(
                TransferError::ConnectionInterruption.to_string(),
            ));
        } else {
            self.set_status(OpStatus::Cancelled);
        }
    }

    /// Failure injected from outside the accept loop (e.g. disconnect).
    pub fn fail(&self, cause: TransferError) {
        self.set_status(OpStatus::Failed(cause.to_string()));
    }
}

/// Available bytes on the volume holding `path`: the disk with the
/// longest mount point that prefixes the path.
fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
