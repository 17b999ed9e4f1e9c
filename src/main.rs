use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;
use log::{debug, info};
use mdns_sd::ServiceDaemon;
use tokio::sync::mpsc;

use lanwarp::bootstrap;
use lanwarp::service;
use lanwarp::{
    Authenticator, Config, EventBus, FsCredentialStore, RemoteManager, ServiceBrowser,
    ServiceListener, TransferRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = Arc::new(Config::from_env()?);
    info!(
        "Starting lanwarp node {} ({}) on {}",
        config.uuid, config.hostname, config.address
    );

    fs::create_dir_all(&config.receive_dir).with_context(|| {
        format!(
            "could not create receive directory {}",
            config.receive_dir.display()
        )
    })?;

    let store =
        FsCredentialStore::new(config.data_dir.clone()).context("could not open credential store")?;
    let auth = Arc::new(Authenticator::new(
        Box::new(store),
        &config.group_code,
        config.hostname.clone(),
        config.address,
    ));
    // Generate the credential up front so every server starts with it.
    auth.credentials().context("could not prepare TLS credential")?;

    let registry = Arc::new(TransferRegistry::new());
    let events = EventBus::default();
    let manager = RemoteManager::new(config.clone(), auth.clone(), registry, events.clone());

    // Bootstrap surfaces: the insecure registration RPC plus the v1 UDP
    // responder, both on the auth port.
    service::start_registration_server(config.clone(), auth.clone()).await?;
    tokio::spawn(bootstrap::serve_certificates(auth.clone(), config.auth_port));

    // The main TLS transfer service.
    service::start_warp_server(config.clone(), auth.clone(), manager.clone()).await?;

    // Browse before announcing so peers seen during our own flush dance
    // are not missed.
    let mdns = ServiceDaemon::new().context("could not start mDNS daemon")?;
    let (tx, rx) = mpsc::channel(32);
    ServiceBrowser::start(&mdns, config.uuid.clone(), tx)?;
    tokio::spawn(manager.clone().run(rx));

    let listener = ServiceListener::new(mdns.clone(), config.as_ref().clone());
    listener.announce().await?;

    // Surface events in the log; a UI would subscribe the same way.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            debug!("event: {event:?}");
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Ready; receiving into {}", config.receive_dir.display());
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    info!("Shutting down");
    listener.withdraw();
    manager.shutdown().await;
    Ok(())
}
