//! Registry of known remotes, keyed by UUID.
//!
//! The only writer of the registry is the discovery path (plus the
//! duplex self-heal); everything else takes snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, Mutex};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

use crate::auth::Authenticator;
use crate::config::Config;
use crate::discovery::{DiscoveryEvent, RemoteDescriptor};
use crate::events::{Event, EventBus};
use crate::remote::{Remote, RemoteStatus};
use crate::transfer::TransferRegistry;

pub struct RemoteManager {
    remotes: Mutex<HashMap<String, Arc<Remote>>>,
    config: Arc<Config>,
    auth: Arc<Authenticator>,
    registry: Arc<TransferRegistry>,
    events: EventBus,
}

impl RemoteManager {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<Authenticator>,
        registry: Arc<TransferRegistry>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            remotes: Mutex::new(HashMap::new()),
            config,
            auth,
            registry,
            events,
        })
    }

    pub fn transfer_registry(&self) -> Arc<TransferRegistry> {
        self.registry.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Consume discovery events until the channel closes, dropping
    /// finished transfer operations on a fixed cadence along the way.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<DiscoveryEvent>) {
        let mut prune_tick = tokio::time::interval(PRUNE_INTERVAL);
        prune_tick.tick().await;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(DiscoveryEvent::Appeared(descriptor)) => self.on_discovered(descriptor).await,
                    Some(DiscoveryEvent::Lost(uuid)) => self.on_removed(&uuid).await,
                    None => break,
                },
                _ = prune_tick.tick() => self.registry.prune().await,
            }
        }
        debug!("Discovery event loop ended");
    }

    /// New or refreshed service record for a peer. Unknown UUIDs get a
    /// Remote and a connection attempt; known ones reconnect only when
    /// they are down, otherwise this is a dedup no-op.
    pub async fn on_discovered(&self, descriptor: RemoteDescriptor) {
        let uuid = descriptor.uuid.clone();
        let remote = {
            let mut remotes = self.remotes.lock().await;
            match remotes.get(&uuid) {
                Some(remote) => {
                    remote.update_descriptor(descriptor);
                    remote.clone()
                }
                None => {
                    info!("Registering new remote {uuid}");
                    let remote = Remote::new(
                        descriptor,
                        self.config.clone(),
                        self.auth.clone(),
                        self.registry.clone(),
                        self.events.clone(),
                    );
                    remotes.insert(uuid.clone(), remote.clone());
                    remote
                }
            }
        };

        match remote.status() {
            RemoteStatus::Connected
            | RemoteStatus::OpeningConnection
            | RemoteStatus::FetchingCredentials
            | RemoteStatus::AcquiringDuplex => {
                debug!("Remote {uuid} already active, ignoring duplicate record");
            }
            _ => {
                tokio::spawn(async move {
                    remote.start_connection().await;
                });
            }
        }
    }

    /// The peer withdrew its record: shut its Remote down and forget it.
    pub async fn on_removed(&self, uuid: &str) {
        let removed = self.remotes.lock().await.remove(uuid);
        if let Some(remote) = removed {
            remote.disconnect(Some("service withdrawn")).await;
            self.events.publish(Event::RemoteRemoved {
                uuid: uuid.to_string(),
            });
        }
    }

    pub async fn remote(&self, uuid: &str) -> Option<Arc<Remote>> {
        self.remotes.lock().await.get(uuid).cloned()
    }

    /// Does the caller's connection to us have a live counterpart from
    /// our side? True once their Remote is at least acquiring duplex.
    pub async fn has_duplex(&self, uuid: &str) -> bool {
        match self.remote(uuid).await {
            Some(remote) => matches!(
                remote.status(),
                RemoteStatus::AcquiringDuplex | RemoteStatus::Connected
            ),
            None => false,
        }
    }

    /// Duplex self-heal: if we know the peer but are not connecting to
    /// it, start our own outbound connection so both directions come up.
    pub async fn ensure_connecting(&self, uuid: &str) {
        let Some(remote) = self.remote(uuid).await else {
            debug!("Cannot self-heal duplex with unknown remote {uuid}");
            return;
        };
        if matches!(
            remote.status(),
            RemoteStatus::Idle | RemoteStatus::Disconnected | RemoteStatus::Error
        ) {
            info!("Starting outbound connection to {uuid} to resolve duplex race");
            tokio::spawn(async move {
                remote.start_connection().await;
            });
        }
    }

    /// Snapshot of (uuid, status) pairs for polling UIs.
    pub async fn snapshot(&self) -> Vec<(String, RemoteStatus)> {
        self.remotes
            .lock()
            .await
            .values()
            .map(|r| (r.uuid(), r.status()))
            .collect()
    }

    pub async fn shutdown(&self) {
        let remotes: Vec<Arc<Remote>> = self.remotes.lock().await.values().cloned().collect();
        for remote in remotes {
            remote.disconnect(Some("shutting down")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialStore;
    use crate::config::ApiVersion;
    use std::sync::Mutex as StdMutex;

    struct MemStore(StdMutex<HashMap<String, Vec<u8>>>);

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

    fn manager() -> Arc<RemoteManager> {
        let config = Arc::new(Config {
            uuid: "ME".into(),
            hostname: "me".into(),
            display_name: "Me".into(),
            user_name: "me".into(),
            group_code: "Warpinator".into(),
            address: "127.0.0.1".parse().unwrap(),
            port: 42000,
            auth_port: 42001,
            api_version: ApiVersion::V2,
            receive_dir: std::env::temp_dir(),
            data_dir: std::env::temp_dir(),
            allow_overwrite: false,
            auto_accept: false,
            avatar_path: None,
        });
        let auth = Arc::new(Authenticator::new(
            Box::new(MemStore(StdMutex::new(HashMap::new()))),
            "Warpinator",
            "me".into(),
            "127.0.0.1".parse().unwrap(),
        ));
        RemoteManager::new(
            config,
            auth,
            Arc::new(TransferRegistry::new()),
            EventBus::default(),
        )
    }

    fn descriptor(uuid: &str) -> RemoteDescriptor {
        RemoteDescriptor {
            uuid: uuid.into(),
            hostname: "peer".into(),
            address: "127.0.0.1".parse().unwrap(),
            // Nothing listens here; connection attempts fail fast and
            // leave the remote registered in an error state.
            port: 1,
            auth_port: 1,
            api_version: ApiVersion::V2,
        }
    }

    #[tokio::test]
    async fn discovery_registers_each_uuid_once() {
        let manager = manager();
        manager.on_discovered(descriptor("PEER-1")).await;
        manager.on_discovered(descriptor("PEER-1")).await;
        manager.on_discovered(descriptor("PEER-2")).await;

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn removal_forgets_the_remote() {
        let manager = manager();
        manager.on_discovered(descriptor("PEER-1")).await;
        manager.on_removed("PEER-1").await;
        assert!(manager.remote("PEER-1").await.is_none());
        assert!(!manager.has_duplex("PEER-1").await);
    }

    #[tokio::test]
    async fn unknown_uuid_has_no_duplex() {
        let manager = manager();
        assert!(!manager.has_duplex("NOBODY").await);
    }
}
