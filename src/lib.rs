pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod manager;
pub mod remote;
pub mod service;
pub mod transfer;

// Import generated protobuf code
pub mod proto {
    tonic::include_proto!("warp");
}

// Re-export key components for easier access
pub use auth::{Authenticator, CredentialStore, FsCredentialStore};
pub use config::{ApiVersion, Config};
pub use discovery::{DiscoveryEvent, RemoteDescriptor, ServiceBrowser, ServiceListener};
pub use errors::{BootstrapError, HandshakeError, SinkError, TransferError};
pub use events::{Event, EventBus};
pub use manager::RemoteManager;
pub use remote::{Remote, RemoteStatus};
pub use transfer::{Direction, OpStatus, TransferRegistry, TransferSelection};
