//! gRPC surface: the TLS Warp service and the insecure registration
//! service, both server roles of the wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::manager::RemoteManager;
use crate::proto::warp_registration_server::{WarpRegistration, WarpRegistrationServer};
use crate::proto::warp_server::{Warp, WarpServer};
use crate::proto::{
    FileChunk, HaveDuplex, LookupName, OpInfo, RegRequest, RegResponse, RemoteMachineAvatar,
    RemoteMachineInfo, StopInfo, TransferOpRequest, VoidType,
};
use crate::transfer::{ReceiveFileOperation, TransferRegistry, CHUNK_SIZE};

const DUPLEX_POLL_TICKS: u32 = 10;
const DUPLEX_POLL_INTERVAL: Duration = Duration::from_millis(250);
const AVATAR_CHUNK: usize = 64 * 1024;

pub struct WarpService {
    config: Arc<Config>,
    manager: Arc<RemoteManager>,
    registry: Arc<TransferRegistry>,
}

impl WarpService {
    pub fn new(config: Arc<Config>, manager: Arc<RemoteManager>) -> Self {
        let registry = manager.transfer_registry();
        Self {
            config,
            manager,
            registry,
        }
    }

    /// Server half of the duplex handshake: confirm the caller once our
    /// own outbound connection to it is at least acquiring duplex,
    /// proactively dialing it if we are not. Both sides dial
    /// independently, so neither may report Connected on a one-way link.
    async fn confirm_duplex(&self, caller: &LookupName) -> Result<bool, Status> {
        for tick in 0..DUPLEX_POLL_TICKS {
            if self.manager.has_duplex(&caller.id).await {
                debug!("Duplex with {} confirmed after {tick} tick(s)", caller.id);
                return Ok(true);
            }
            self.manager.ensure_connecting(&caller.id).await;
            sleep(DUPLEX_POLL_INTERVAL).await;
        }
        warn!("Duplex with {} not confirmed within the poll budget", caller.id);
        Err(Status::deadline_exceeded("duplex not established"))
    }

    async fn receive_op(
        &self,
        info: Option<&OpInfo>,
    ) -> Result<Arc<ReceiveFileOperation>, Status> {
        let info = info.ok_or_else(|| Status::invalid_argument("missing op info"))?;
        self.registry
            .receive_op(&info.ident, info.timestamp)
            .await
            .map_err(|_| Status::not_found("transfer not found"))
    }
}

#[tonic::async_trait]
impl Warp for WarpService {
    /// v1 name for the duplex check; same semantics as WaitingForDuplex.
    async fn check_duplex_connection(
        &self,
        request: Request<LookupName>,
    ) -> Result<Response<HaveDuplex>, Status> {
        let caller = request.into_inner();
        let response = self.confirm_duplex(&caller).await?;
        Ok(Response::new(HaveDuplex { response }))
    }

    async fn waiting_for_duplex(
        &self,
        request: Request<LookupName>,
    ) -> Result<Response<HaveDuplex>, Status> {
        let caller = request.into_inner();
        let response = self.confirm_duplex(&caller).await?;
        Ok(Response::new(HaveDuplex { response }))
    }

    async fn get_remote_machine_info(
        &self,
        _request: Request<LookupName>,
    ) -> Result<Response<RemoteMachineInfo>, Status> {
        Ok(Response::new(RemoteMachineInfo {
            display_name: self.config.display_name.clone(),
            user_name: self.config.user_name.clone(),
        }))
    }

    type GetRemoteMachineAvatarStream = ReceiverStream<Result<RemoteMachineAvatar, Status>>;

    async fn get_remote_machine_avatar(
        &self,
        _request: Request<LookupName>,
    ) -> Result<Response<Self::GetRemoteMachineAvatarStream>, Status> {
        let Some(path) = self.config.avatar_path.clone() else {
            return Err(Status::not_found("no avatar configured"));
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Status::not_found(format!("avatar unreadable: {e}")))?;

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for part in bytes.chunks(AVATAR_CHUNK) {
                let message = RemoteMachineAvatar {
                    avatar_chunk: part.to_vec(),
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    /// Inbound transfer announcement. A repeated timestamp is a retry
    /// of a known operation, not a duplicate.
    async fn process_transfer_op_request(
        &self,
        request: Request<TransferOpRequest>,
    ) -> Result<Response<VoidType>, Status> {
        let request = request.into_inner();
        let info = request
            .info
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing op info"))?;

        if let Ok(existing) = self.registry.receive_op(&info.ident, info.timestamp).await {
            existing
                .reinitialize()
                .map_err(|e| Status::resource_exhausted(e.to_string()))?;
            return Ok(Response::new(VoidType::default()));
        }

        info!(
            "Transfer request from {}: {} item(s), {} bytes",
            request.sender_name, request.count, request.size
        );
        let op = Arc::new(ReceiveFileOperation::new(
            info.ident.clone(),
            &request,
            self.config.receive_dir.clone(),
            self.config.allow_overwrite,
            self.manager.events(),
        ));
        self.registry.register_receive(op.clone()).await;

        if let Err(e) = op.initialize() {
            return Err(Status::resource_exhausted(e.to_string()));
        }

        if self.config.auto_accept {
            let manager = self.manager.clone();
            let own_uuid = self.config.uuid.clone();
            tokio::spawn(async move {
                let Some(remote) = manager.remote(&op.remote_uuid).await else {
                    warn!("Cannot auto-accept from unknown remote {}", op.remote_uuid);
                    return;
                };
                match remote.client().await {
                    Ok(client) => {
                        if let Err(e) = op.accept(client, &own_uuid).await {
                            warn!("Auto-accepted transfer failed: {e}");
                        }
                    }
                    Err(e) => warn!("Cannot auto-accept, no channel: {e}"),
                }
            });
        }

        Ok(Response::new(VoidType::default()))
    }

    type StartTransferStream = ReceiverStream<Result<FileChunk, Status>>;

    /// Called by the party that wants to receive; we are the sender.
    async fn start_transfer(
        &self,
        request: Request<OpInfo>,
    ) -> Result<Response<Self::StartTransferStream>, Status> {
        let info = request.into_inner();
        let op = self
            .registry
            .send_op(&info.ident, info.timestamp)
            .await
            .map_err(|_| Status::not_found("transfer not found"))?;

        info!(
            "Peer {} accepted transfer {}, streaming {} bytes",
            info.ident, info.timestamp, op.total_size
        );
        let rx = op.open_stream(CHUNK_SIZE);
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    /// Decline of a pending request (either direction).
    async fn cancel_transfer_op_request(
        &self,
        request: Request<OpInfo>,
    ) -> Result<Response<VoidType>, Status> {
        let info = request.into_inner();
        if let Ok(op) = self.registry.send_op(&info.ident, info.timestamp).await {
            info!("Peer {} declined transfer {}", info.ident, info.timestamp);
            op.declined();
            return Ok(Response::new(VoidType::default()));
        }
        if let Ok(op) = self.registry.receive_op(&info.ident, info.timestamp).await {
            op.handle_remote_stop(false);
            return Ok(Response::new(VoidType::default()));
        }
        Err(Status::not_found("transfer not found"))
    }

    /// Mid-transfer stop (either direction), with an error flag.
    async fn stop_transfer(
        &self,
        request: Request<StopInfo>,
    ) -> Result<Response<VoidType>, Status> {
        let stop = request.into_inner();
        let info = stop.info.as_ref();

        if let Some(info) = info {
            if let Ok(op) = self.registry.send_op(&info.ident, info.timestamp).await {
                if stop.error {
                    op.fail(crate::errors::TransferError::ConnectionInterruption);
                } else {
                    op.cancel();
                }
                return Ok(Response::new(VoidType::default()));
            }
        }

        let op = self.receive_op(info).await?;
        op.handle_remote_stop(stop.error);
        Ok(Response::new(VoidType::default()))
    }

    /// Liveness no-op; logs whether we know the caller.
    async fn ping(&self, request: Request<LookupName>) -> Result<Response<VoidType>, Status> {
        let caller = request.into_inner();
        if self.manager.remote(&caller.id).await.is_none() {
            debug!("Ping from unknown remote {}", caller.id);
        }
        Ok(Response::new(VoidType::default()))
    }
}

pub struct RegistrationService {
    auth: Arc<Authenticator>,
}

impl RegistrationService {
    pub fn new(auth: Arc<Authenticator>) -> Self {
        Self { auth }
    }
}

#[tonic::async_trait]
impl WarpRegistration for RegistrationService {
    async fn request_certificate(
        &self,
        request: Request<RegRequest>,
    ) -> Result<Response<RegResponse>, Status> {
        let request = request.into_inner();
        info!(
            "Certificate requested by {} ({})",
            request.hostname, request.ip
        );
        let locked_cert = self
            .auth
            .credentials()
            .and_then(|creds| self.auth.box_certificate(creds.cert_pem.as_bytes()))
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RegResponse { locked_cert }))
    }
}

/// Start the TLS Warp server in the background.
pub async fn start_warp_server(
    config: Arc<Config>,
    auth: Arc<Authenticator>,
    manager: Arc<RemoteManager>,
) -> Result<()> {
    let creds = auth.credentials().context("could not load credentials")?;
    let identity = Identity::from_pem(&creds.cert_pem, &creds.key_pem);
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let service = WarpService::new(config.clone(), manager);
    let server = Server::builder()
        .tls_config(ServerTlsConfig::new().identity(identity))
        .context("invalid server TLS configuration")?
        .add_service(WarpServer::new(service))
        .serve(addr);

    info!("Warp server listening on {addr} (TLS)");
    tokio::spawn(async move {
        match server.await {
            Ok(_) => info!("Warp server shutdown gracefully"),
            Err(e) => error!("Warp server error: {e}"),
        }
    });
    Ok(())
}

/// Start the insecure registration server in the background.
pub async fn start_registration_server(config: Arc<Config>, auth: Arc<Authenticator>) -> Result<()> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], config.auth_port));
    let server = Server::builder()
        .add_service(WarpRegistrationServer::new(RegistrationService::new(auth)))
        .serve(addr);

    info!("Registration server listening on {addr}");
    tokio::spawn(async move {
        match server.await {
            Ok(_) => info!("Registration server shutdown gracefully"),
            Err(e) => error!("Registration server error: {e}"),
        }
    });
    Ok(())
}
