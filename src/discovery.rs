//! mDNS service advertisement and browsing.
//!
//! The listener publishes this node's record; the browser turns peers'
//! records into `RemoteDescriptor`s for the manager. On startup the
//! listener first publishes a transient `type=flush` record and
//! withdraws it, so peers with stale TXT data in their mDNS caches drop
//! it before the real record arrives.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::config::{ApiVersion, Config};

pub const SERVICE_TYPE: &str = "_warpinator._tcp.local.";
const FLUSH_SETTLE: Duration = Duration::from_secs(2);

/// A peer as seen through its mDNS record. Owned by exactly one Remote
/// once the manager picks it up.
#[derive(Debug, Clone)]
pub struct RemoteDescriptor {
    pub uuid: String,
    pub hostname: String,
    pub address: IpAddr,
    pub port: u16,
    pub auth_port: u16,
    pub api_version: ApiVersion,
}

impl RemoteDescriptor {
    /// Parse a resolved service record. Returns None for records that
    /// are not valid peer advertisements (including flush records).
    fn from_service_info(info: &ServiceInfo) -> Option<Self> {
        let mut txt = HashMap::new();
        for prop in info.get_properties().iter() {
            if let Some(val) = prop.val() {
                if let Ok(value) = String::from_utf8(val.to_vec()) {
                    txt.insert(prop.key().to_string(), value);
                }
            }
        }

        if txt.get("type").map(String::as_str) == Some("flush") {
            return None;
        }

        let address = info.get_addresses().iter().next().copied()?;
        let uuid = instance_name(info.get_fullname())?;

        Some(Self {
            uuid,
            hostname: txt.get("hostname")?.clone(),
            address,
            port: info.get_port(),
            auth_port: txt.get("auth-port")?.parse().ok()?,
            api_version: ApiVersion::parse(txt.get("api-version")?)?,
        })
    }
}

/// Instance portion of a service fullname ("uuid._warpinator._tcp.local.").
fn instance_name(fullname: &str) -> Option<String> {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|s| s.trim_end_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| fullname.split('.').next().map(str::to_string))
}

#[derive(Debug)]
pub enum DiscoveryEvent {
    Appeared(RemoteDescriptor),
    Lost(String),
}

/// Publishes this node's service record.
pub struct ServiceListener {
    mdns: ServiceDaemon,
    config: Config,
    fullname: String,
}

impl ServiceListener {
    pub fn new(mdns: ServiceDaemon, config: Config) -> Self {
        let fullname = format!("{}.{}", config.uuid, SERVICE_TYPE);
        Self {
            mdns,
            config,
            fullname,
        }
    }

    /// Run the flush-then-republish dance, then advertise the real
    /// record. Peers cache TXT records aggressively; the transient
    /// flush record forces those caches to drop stale entries.
    pub async fn announce(&self) -> Result<()> {
        info!("Flushing stale mDNS state for {}", self.config.uuid);
        self.register(true)?;
        sleep(FLUSH_SETTLE).await;
        if let Err(e) = self.mdns.unregister(&self.fullname) {
            warn!("Could not withdraw flush record: {e}");
        }
        sleep(FLUSH_SETTLE).await;

        self.register(false)?;
        info!(
            "Advertising {} on {} port {}",
            self.config.uuid, self.config.address, self.config.port
        );
        Ok(())
    }

    fn register(&self, flush: bool) -> Result<()> {
        let mut properties = HashMap::new();
        properties.insert("hostname".to_string(), self.config.hostname.clone());
        properties.insert("auth-port".to_string(), self.config.auth_port.to_string());
        properties.insert(
            "api-version".to_string(),
            self.config.api_version.as_str().to_string(),
        );
        properties.insert(
            "type".to_string(),
            if flush { "flush" } else { "real" }.to_string(),
        );

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.config.uuid,
            &format!("{}.local.", self.config.hostname),
            self.config.address,
            self.config.port,
            properties,
        )
        .context("could not build service record")?;

        self.mdns
            .register(service_info)
            .context("could not register service record")?;
        Ok(())
    }

    /// Withdraw our record; peers see a ServiceRemoved event.
    pub fn withdraw(&self) {
        if let Err(e) = self.mdns.unregister(&self.fullname) {
            warn!("Failed to unregister service: {e}");
        }
    }
}

/// Observes peers' records and forwards them as discovery events.
pub struct ServiceBrowser;

impl ServiceBrowser {
    /// Start browsing. Events land on `tx`; the loop ends when the
    /// daemon shuts down or the receiver is dropped.
    pub fn start(
        mdns: &ServiceDaemon,
        own_uuid: String,
        tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<()> {
        let receiver = mdns
            .browse(SERVICE_TYPE)
            .context("could not browse for peers")?;

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(descriptor) = RemoteDescriptor::from_service_info(&info) else {
                            debug!("Ignoring non-peer record {}", info.get_fullname());
                            continue;
                        };
                        if descriptor.uuid == own_uuid {
                            continue;
                        }
                        info!(
                            "Discovered peer {} at {}:{} (api v{})",
                            descriptor.uuid,
                            descriptor.address,
                            descriptor.port,
                            descriptor.api_version.as_str()
                        );
                        if tx.send(DiscoveryEvent::Appeared(descriptor)).await.is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        let Some(uuid) = instance_name(&fullname) else {
                            continue;
                        };
                        if uuid == own_uuid {
                            continue;
                        }
                        info!("Peer {uuid} withdrew its record");
                        if tx.send(DiscoveryEvent::Lost(uuid)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            debug!("mDNS browse loop ended");
        });

        Ok(())
    }
}
