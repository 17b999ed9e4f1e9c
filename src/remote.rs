//! Per-peer connection lifecycle.
//!
//! Disconnected → OpeningConnection → FetchingCredentials →
//! AcquiringDuplex → Connected, with Idle and Error on the side. All
//! transitions happen inside this type; nothing else writes the status.
//!
//! Each side of a pair dials the other independently, so neither may
//! consider itself Connected until the duplex check confirms the peer
//! sees us too.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::time::sleep;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};

use crate::auth::Authenticator;
use crate::bootstrap::exchange_for;
use crate::config::{ApiVersion, Config};
use crate::discovery::RemoteDescriptor;
use crate::errors::{HandshakeError, TransferError};
use crate::events::{Event, EventBus};
use crate::proto::warp_client::WarpClient;
use crate::proto::LookupName;
use crate::transfer::{SendFileOperation, TransferRegistry, TransferSelection};

const DUPLEX_MAX_ATTEMPTS: u32 = 10;
const DUPLEX_BACKOFF: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSIENT_FAILURE_LIMIT: u32 = 10;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Idle,
    Disconnected,
    OpeningConnection,
    FetchingCredentials,
    AcquiringDuplex,
    Connected,
    Error,
}

/// Peer details fetched after the duplex handshake.
#[derive(Debug, Clone, Default)]
pub struct MachineInfo {
    pub display_name: String,
    pub user_name: String,
    pub avatar: Option<Vec<u8>>,
}

pub struct Remote {
    descriptor: Mutex<RemoteDescriptor>,
    status: Mutex<RemoteStatus>,
    peer_cert: Mutex<Option<Vec<u8>>>,
    client: tokio::sync::Mutex<Option<WarpClient<Channel>>>,
    machine_info: Mutex<Option<MachineInfo>>,
    transient_failures: AtomicU32,
    config: Arc<Config>,
    auth: Arc<Authenticator>,
    registry: Arc<TransferRegistry>,
    events: EventBus,
}

impl Remote {
    pub fn new(
        descriptor: RemoteDescriptor,
        config: Arc<Config>,
        auth: Arc<Authenticator>,
        registry: Arc<TransferRegistry>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor: Mutex::new(descriptor),
            status: Mutex::new(RemoteStatus::Idle),
            peer_cert: Mutex::new(None),
            client: tokio::sync::Mutex::new(None),
            machine_info: Mutex::new(None),
            transient_failures: AtomicU32::new(0),
            config,
            auth,
            registry,
            events,
        })
    }

    pub fn uuid(&self) -> String {
        self.lock_descriptor().uuid.clone()
    }

    pub fn status(&self) -> RemoteStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn machine_info(&self) -> Option<MachineInfo> {
        self.machine_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn descriptor(&self) -> RemoteDescriptor {
        self.lock_descriptor().clone()
    }

    /// Refresh mDNS-derived fields after a metadata change.
    pub fn update_descriptor(&self, descriptor: RemoteDescriptor) {
        *self.lock_descriptor() = descriptor;
    }

    fn lock_descriptor(&self) -> std::sync::MutexGuard<'_, RemoteDescriptor> {
        self.descriptor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: RemoteStatus) {
        {
            let mut current = self
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *current == status {
                return;
            }
            *current = status;
        }
        self.events.publish(Event::RemoteStatusChanged {
            uuid: self.uuid(),
            status,
        });
    }

    fn lookup_name(&self) -> LookupName {
        LookupName {
            id: self.config.uuid.clone(),
            readable_name: self.config.display_name.clone(),
        }
    }

    /// A cloned client handle for transfer operations.
    pub async fn client(&self) -> Result<WarpClient<Channel>, TransferError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or(TransferError::ConnectionInterruption)
    }

    /// Dispatch a transfer of the given selections to this peer:
    /// announce the operation and register it so the peer's
    /// StartTransfer call can find it. Streaming starts when the peer
    /// accepts.
    pub async fn send(
        &self,
        selections: Vec<TransferSelection>,
    ) -> Result<Arc<SendFileOperation>, TransferError> {
        let mut client = self.client().await?;
        let op = Arc::new(
            SendFileOperation::new(self.uuid(), selections, self.events.clone())
                .map_err(|e| TransferError::Unknown(e.to_string()))?,
        );
        self.registry.register_send(op.clone()).await;
        if let Err(e) = op
            .request(&mut client, &self.config.uuid, &self.config.display_name)
            .await
        {
            op.fail(TransferError::ConnectionInterruption);
            return Err(e);
        }
        Ok(op)
    }

    /// Entry point from discovery. Already-connected remotes only get a
    /// liveness ping; a failed ping forces a disconnect and one fresh
    /// connection attempt.
    pub async fn start_connection(self: &Arc<Self>) {
        match self.status() {
            RemoteStatus::Connected | RemoteStatus::AcquiringDuplex => {
                if self.ping().await {
                    return;
                }
                warn!("Ping to {} failed, reconnecting", self.uuid());
                self.disconnect(Some("ping failed")).await;
                self.connect().await;
            }
            RemoteStatus::OpeningConnection | RemoteStatus::FetchingCredentials => {
                debug!("Connection to {} already in progress", self.uuid());
            }
            _ => self.connect().await,
        }
    }

    /// Run the full connection sequence. A TLS failure with a cached
    /// certificate invalidates the cache and retries exactly once.
    pub async fn connect(self: &Arc<Self>) {
        let uuid = self.uuid();
        let mut cert_retry_done = false;
        loop {
            let had_cached_cert = self.cached_cert().is_some();
            match self.connect_once().await {
                Ok(()) => {
                    info!("Connected to {uuid}");
                    self.transient_failures.store(0, Ordering::Relaxed);
                    self.spawn_keepalive();
                    return;
                }
                Err(e) if had_cached_cert && !cert_retry_done && invalidates_pinned_cert(&e) => {
                    warn!("Connection to {uuid} failed ({e:#}), discarding pinned certificate and retrying");
                    *self.lock_peer_cert() = None;
                    cert_retry_done = true;
                }
                Err(e) => {
                    warn!("Connection to {uuid} failed: {e:#}");
                    self.set_status(RemoteStatus::Error);
                    return;
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        self.set_status(RemoteStatus::OpeningConnection);

        let cert = match self.cached_cert() {
            Some(cert) => cert,
            None => self.fetch_certificate().await?,
        };

        let descriptor = self.descriptor();
        let channel = self.open_channel(&descriptor, &cert).await?;
        let mut client = WarpClient::new(channel);

        self.set_status(RemoteStatus::AcquiringDuplex);
        self.acquire_duplex(&mut client, descriptor.api_version)
            .await?;

        self.retrieve_remote_info(&mut client).await;

        *self.client.lock().await = Some(client);
        self.set_status(RemoteStatus::Connected);
        Ok(())
    }

    fn cached_cert(&self) -> Option<Vec<u8>> {
        self.lock_peer_cert().clone()
    }

    fn lock_peer_cert(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.peer_cert
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bootstrap the peer's certificate over the insecure channel and
    /// adopt the endpoint that actually answered.
    async fn fetch_certificate(&self) -> Result<Vec<u8>> {
        self.set_status(RemoteStatus::FetchingCredentials);
        let descriptor = self.descriptor();
        let exchange = exchange_for(
            descriptor.api_version,
            self.auth.clone(),
            self.config.hostname.clone(),
        );
        let outcome = exchange
            .fetch(&descriptor)
            .await
            .context("certificate bootstrap failed")?;

        {
            let mut descriptor = self.lock_descriptor();
            descriptor.address = outcome.address;
            descriptor.port = outcome.port;
        }
        *self.lock_peer_cert() = Some(outcome.certificate_pem.clone());
        Ok(outcome.certificate_pem)
    }

    /// TLS channel trusting only the peer's delivered certificate. The
    /// self-signed cert is its own root, so using it as the sole CA is
    /// pinning, not CA validation.
    async fn open_channel(
        &self,
        descriptor: &RemoteDescriptor,
        cert_pem: &[u8],
    ) -> Result<Channel> {
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(cert_pem))
            .domain_name(descriptor.hostname.clone());

        let endpoint = format!("https://{}:{}", descriptor.address, descriptor.port);
        Channel::from_shared(endpoint.clone())
            .with_context(|| format!("invalid endpoint {endpoint}"))?
            .tls_config(tls)
            .context("invalid TLS configuration")?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect()
            .await
            .with_context(|| format!("could not open TLS channel to {endpoint}"))
    }

    /// Ask the peer whether it sees our inbound connection; fixed 2s
    /// backoff, ten attempts, then the whole connect fails.
    async fn acquire_duplex(
        &self,
        client: &mut WarpClient<Channel>,
        api_version: ApiVersion,
    ) -> Result<()> {
        for attempt in 1..=DUPLEX_MAX_ATTEMPTS {
            let response = match api_version {
                ApiVersion::V1 => client.check_duplex_connection(self.lookup_name()).await,
                ApiVersion::V2 => client.waiting_for_duplex(self.lookup_name()).await,
            };

            match response.map(|have| have.into_inner().response) {
                Ok(true) => {
                    debug!("Duplex with {} confirmed on attempt {attempt}", self.uuid());
                    return Ok(());
                }
                Ok(false) => debug!("Peer {} does not see us yet (attempt {attempt})", self.uuid()),
                Err(e) => debug!("Duplex check against {} failed: {e} (attempt {attempt})", self.uuid()),
            }

            if attempt < DUPLEX_MAX_ATTEMPTS {
                sleep(DUPLEX_BACKOFF).await;
            }
        }
        Err(anyhow!(HandshakeError::DuplexTimeout))
    }

    /// Display name, user name and avatar; the avatar is best-effort.
    async fn retrieve_remote_info(&self, client: &mut WarpClient<Channel>) {
        let mut info = MachineInfo::default();

        match client.get_remote_machine_info(self.lookup_name()).await {
            Ok(response) => {
                let response = response.into_inner();
                info.display_name = response.display_name;
                info.user_name = response.user_name;
            }
            Err(e) => warn!("Could not fetch machine info from {}: {e}", self.uuid()),
        }

        if let Ok(response) = client.get_remote_machine_avatar(self.lookup_name()).await {
            let mut avatar = Vec::new();
            let mut stream = response.into_inner();
            while let Some(Ok(part)) = stream.next().await {
                avatar.extend_from_slice(&part.avatar_chunk);
            }
            if !avatar.is_empty() {
                info.avatar = Some(avatar);
            }
        }

        *self
            .machine_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(info);
    }

    /// Liveness check against an established channel.
    pub async fn ping(&self) -> bool {
        let client = self.client.lock().await.clone();
        let Some(mut client) = client else {
            return false;
        };
        match client.ping(self.lookup_name()).await {
            Ok(_) => {
                self.transient_failures.store(0, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!("Ping to {} failed: {e}", self.uuid());
                self.note_transient_failure().await;
                false
            }
        }
    }

    /// Periodic liveness ping while Connected. Each failure counts
    /// toward the transient-failure limit; a success resets it. The
    /// loop ends once the status leaves Connected.
    fn spawn_keepalive(self: &Arc<Self>) {
        let remote = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                if remote.status() != RemoteStatus::Connected {
                    return;
                }
                remote.ping().await;
            }
        });
    }

    /// Count a transient channel failure; the tenth in a row forces an
    /// unconditional disconnect.
    pub async fn note_transient_failure(&self) {
        let failures = self.transient_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= TRANSIENT_FAILURE_LIMIT {
            warn!(
                "{} transient failures against {}, disconnecting",
                failures,
                self.uuid()
            );
            self.disconnect(Some("too many transient failures")).await;
        }
    }

    /// Tear the connection down. Never fails: channel-close problems
    /// are logged, active transfers are stopped with an interruption.
    pub async fn disconnect(&self, reason: Option<&str>) {
        let uuid = self.uuid();
        match reason {
            Some(reason) => info!("Disconnecting from {uuid}: {reason}"),
            None => info!("Disconnecting from {uuid}"),
        }
        self.registry.interrupt_remote(&uuid).await;
        *self.client.lock().await = None;
        self.transient_failures.store(0, Ordering::Relaxed);
        self.set_status(RemoteStatus::Disconnected);
    }

    #[cfg(test)]
    pub(crate) fn force_status(&self, status: RemoteStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    #[cfg(test)]
    pub(crate) async fn install_client(&self, client: WarpClient<Channel>) {
        *self.client.lock().await = Some(client);
    }
}

/// Only a transport-level failure casts doubt on the pinned
/// certificate; a failed duplex handshake says nothing about the trust
/// material.
fn invalidates_pinned_cert(error: &anyhow::Error) -> bool {
    error.downcast_ref::<HandshakeError>().is_none()
}
