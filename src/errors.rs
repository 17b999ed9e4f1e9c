//! Error taxonomy for the connection, bootstrap and transfer paths.
//!
//! Bootstrap and handshake failures are retried locally with bounded
//! backoff and only surface once the retry budget is spent. Sink errors
//! stay inside the transfer engine: `SinkError::FilenameMismatch` is a
//! control signal that triggers writer rollover, never a failure.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while obtaining a peer's certificate before any TLS exists.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("timed out waiting for the peer")]
    Timeout,
}

/// Failures while verifying the duplex handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("remote {0} is not known to this node")]
    UnknownRemote(String),

    #[error("duplex connection not established")]
    DuplexNotEstablished,

    #[error("timed out waiting for duplex confirmation")]
    DuplexTimeout,
}

/// Failures of a transfer operation.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("connection to the peer was interrupted")]
    ConnectionInterruption,

    #[error("transfer was declined by the peer")]
    Declined,

    #[error("permission to read the selection was declined")]
    PermissionDeclined,

    #[error("transfer was cancelled")]
    Cancelled,

    #[error("no transfer operation with timestamp {0}")]
    NotFound(u64),

    #[error("transfer failed: {0}")]
    Unknown(String),
}

/// Filesystem-sink outcomes on the receive path.
///
/// `FilenameMismatch` means "this chunk belongs to a different item than
/// the current writer" and is caught internally to rotate writers.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("chunk path does not belong to the current writer")]
    FilenameMismatch,

    #[error("file already exists and no free name was found: {0}")]
    FileExists(PathBuf),

    #[error("directory already exists and no free name was found: {0}")]
    DirectoryExists(PathBuf),

    #[error("not enough free space: need {needed} bytes, {available} available")]
    SpaceUnavailable { needed: u64, available: u64 },

    #[error("filesystem error: {0}")]
    Undefined(#[from] std::io::Error),
}

impl From<SinkError> for TransferError {
    fn from(err: SinkError) -> Self {
        TransferError::Unknown(err.to_string())
    }
}
