//! Certificate bootstrap: obtaining a peer's certificate before any TLS
//! channel exists.
//!
//! Two interchangeable strategies, selected by the peer's advertised API
//! version. Both first talk UDP to the candidate endpoint — the address
//! a peer advertises over mDNS is sometimes unusable, and a connected
//! UDP socket resolves the route that actually works.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tonic::transport::Channel;

use crate::auth::Authenticator;
use crate::config::ApiVersion;
use crate::discovery::RemoteDescriptor;
use crate::errors::BootstrapError;
use crate::proto::warp_registration_client::WarpRegistrationClient;
use crate::proto::RegRequest;

const UDP_REQUEST: &[u8] = b"REQUEST";
const BOOTSTRAP_DEADLINE: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 64 * 1024;

/// What a successful bootstrap yields: the peer's certificate and the
/// endpoint that actually answered.
pub struct BootstrapOutcome {
    pub certificate_pem: Vec<u8>,
    pub address: IpAddr,
    pub port: u16,
}

#[async_trait]
pub trait CertificateExchange: Send + Sync {
    async fn fetch(&self, descriptor: &RemoteDescriptor)
        -> Result<BootstrapOutcome, BootstrapError>;
}

pub fn exchange_for(
    api_version: ApiVersion,
    auth: Arc<Authenticator>,
    own_hostname: String,
) -> Box<dyn CertificateExchange> {
    match api_version {
        ApiVersion::V1 => Box::new(UdpExchange { auth }),
        ApiVersion::V2 => Box::new(GrpcExchange { auth, own_hostname }),
    }
}

/// Open a UDP socket connected to the candidate endpoint. Also used by
/// the v2 path purely to learn the peer's routable address.
async fn connect_udp(addr: IpAddr, port: u16) -> Result<(UdpSocket, SocketAddr), BootstrapError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("fixed address parses")
    } else {
        "[::]:0".parse().expect("fixed address parses")
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| BootstrapError::Connection(e.to_string()))?;
    socket
        .connect((addr, port))
        .await
        .map_err(|e| BootstrapError::Connection(e.to_string()))?;
    let resolved = socket
        .peer_addr()
        .map_err(|e| BootstrapError::Connection(e.to_string()))?;
    Ok((socket, resolved))
}

/// V1: literal ASCII `REQUEST`, one boxed-certificate datagram back.
struct UdpExchange {
    auth: Arc<Authenticator>,
}

#[async_trait]
impl CertificateExchange for UdpExchange {
    async fn fetch(
        &self,
        descriptor: &RemoteDescriptor,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let (socket, resolved) = connect_udp(descriptor.address, descriptor.auth_port).await?;
        debug!("Requesting certificate from {resolved} over UDP");

        socket
            .send(UDP_REQUEST)
            .await
            .map_err(|e| BootstrapError::Connection(e.to_string()))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = timeout(BOOTSTRAP_DEADLINE, socket.recv(&mut buf))
            .await
            .map_err(|_| BootstrapError::Timeout)?
            .map_err(|e| BootstrapError::Connection(e.to_string()))?;

        let blob = std::str::from_utf8(&buf[..len])
            .map_err(|_| BootstrapError::Certificate("response is not UTF-8".into()))?;
        let certificate_pem = self.auth.unbox_certificate(blob)?;

        Ok(BootstrapOutcome {
            certificate_pem,
            address: resolved.ip(),
            port: descriptor.port,
        })
    }
}

/// V2: insecure RequestCertificate RPC on the advertised auth port.
struct GrpcExchange {
    auth: Arc<Authenticator>,
    own_hostname: String,
}

#[async_trait]
impl CertificateExchange for GrpcExchange {
    async fn fetch(
        &self,
        descriptor: &RemoteDescriptor,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        // Bare UDP connection first, purely to resolve the routable
        // address for this peer.
        let (socket, resolved) = connect_udp(descriptor.address, descriptor.auth_port).await?;
        let our_ip = socket
            .local_addr()
            .map_err(|e| BootstrapError::Connection(e.to_string()))?
            .ip();
        drop(socket);

        let endpoint = format!("http://{}:{}", resolved.ip(), descriptor.auth_port);
        debug!("Requesting certificate from {endpoint} over gRPC");

        let channel = Channel::from_shared(endpoint)
            .map_err(|e| BootstrapError::Connection(e.to_string()))?
            .connect_timeout(BOOTSTRAP_DEADLINE)
            .timeout(BOOTSTRAP_DEADLINE)
            .connect()
            .await
            .map_err(|e| BootstrapError::Connection(e.to_string()))?;

        let mut client = WarpRegistrationClient::new(channel);
        let response = timeout(
            BOOTSTRAP_DEADLINE,
            client.request_certificate(RegRequest {
                hostname: self.own_hostname.clone(),
                ip: our_ip.to_string(),
            }),
        )
        .await
        .map_err(|_| BootstrapError::Timeout)?
        .map_err(|e| BootstrapError::Connection(e.to_string()))?;

        let certificate_pem = self.auth.unbox_certificate(&response.into_inner().locked_cert)?;

        Ok(BootstrapOutcome {
            certificate_pem,
            address: resolved.ip(),
            port: descriptor.port,
        })
    }
}

/// V1 responder: serve our own boxed certificate to any peer that sends
/// `REQUEST` to the auth port. Runs until the socket errors out.
pub async fn serve_certificates(auth: Arc<Authenticator>, auth_port: u16) {
    let socket = match UdpSocket::bind(("0.0.0.0", auth_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Could not bind UDP certificate responder on {auth_port}: {e}");
            return;
        }
    };
    info!("UDP certificate responder listening on port {auth_port}");

    let mut buf = [0u8; 128];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP certificate responder stopped: {e}");
                return;
            }
        };

        if &buf[..len] != UDP_REQUEST {
            debug!("Ignoring unexpected datagram from {peer}");
            continue;
        }

        let boxed = match auth
            .credentials()
            .and_then(|creds| auth.box_certificate(creds.cert_pem.as_bytes()))
        {
            Ok(boxed) => boxed,
            Err(e) => {
                warn!("Could not box certificate for {peer}: {e}");
                continue;
            }
        };

        if let Err(e) = socket.send_to(boxed.as_bytes(), peer).await {
            warn!("Could not answer certificate request from {peer}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Authenticator, CredentialStore};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemStore(Mutex<HashMap<String, Vec<u8>>>);

    impl CredentialStore for MemStore {
        fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.0.lock().unwrap().get(key).cloned()
        }
        fn put(&self, key: &str, value: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().insert(key.to_string(), value.to_vec());
            Ok(())
        }
        fn delete(&self, key: &str) {
            self.0.lock().unwrap().remove(key);
        }
    }

    fn authenticator() -> Arc<Authenticator> {
        Arc::new(Authenticator::new(
            Box::new(MemStore(Mutex::new(HashMap::new()))),
            "Warpinator",
            "testhost".into(),
            "127.0.0.1".parse().unwrap(),
        ))
    }

    #[tokio::test]
    async fn udp_exchange_round_trips_against_the_responder() {
        let server_auth = authenticator();
        let expected = server_auth.credentials().unwrap().cert_pem;

        // Bind on an ephemeral port by hand so the test can target it.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let responder_auth = server_auth.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], UDP_REQUEST);
            let creds = responder_auth.credentials().unwrap();
            let boxed = responder_auth
                .box_certificate(creds.cert_pem.as_bytes())
                .unwrap();
            socket.send_to(boxed.as_bytes(), peer).await.unwrap();
        });

        let descriptor = RemoteDescriptor {
            uuid: "PEER".into(),
            hostname: "peer".into(),
            address: "127.0.0.1".parse().unwrap(),
            port: 42000,
            auth_port: port,
            api_version: ApiVersion::V1,
        };

        let exchange = exchange_for(ApiVersion::V1, authenticator(), "me".into());
        let outcome = exchange.fetch(&descriptor).await.unwrap();
        assert_eq!(outcome.certificate_pem, expected.as_bytes());
        assert_eq!(outcome.port, 42000);
    }

    #[tokio::test]
    async fn udp_exchange_times_out_without_a_responder() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let descriptor = RemoteDescriptor {
            uuid: "PEER".into(),
            hostname: "peer".into(),
            address: "127.0.0.1".parse().unwrap(),
            port: 42000,
            auth_port: port,
            api_version: ApiVersion::V1,
        };

        let exchange = exchange_for(ApiVersion::V1, authenticator(), "me".into());
        let result = exchange.fetch(&descriptor).await;
        assert!(matches!(result, Err(BootstrapError::Timeout)));
    }
}
