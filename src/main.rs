#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use ssh_relay::relay::broker::ConnectionBroker;
use ssh_relay::relay::client::SshConnector;
use ssh_relay::relay::config::{HostKeyPolicy, RelayConfig};
use ssh_relay::relay::dispatcher::Relay;
use ssh_relay::relay::exec::ExecEngine;
use ssh_relay::relay::external::{MemoryProfileStore, StaticTokenVerifier, TracingAuditStore};
use ssh_relay::relay::reaper::OrphanReaper;
use ssh_relay::relay::registry::MemorySessionRegistry;
use ssh_relay::relay::server;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = RelayConfig::from_env();
    match &config.ssh.host_key_policy {
        HostKeyPolicy::AcceptAny => {
            warn!("SSH host keys are not verified (SSH_HOST_KEY_POLICY=accept-any)")
        }
        HostKeyPolicy::Pinned(fingerprints) => {
            info!("SSH host keys pinned to {} fingerprint(s)", fingerprints.len())
        }
    }
    if config.allow_anonymous {
        warn!("Anonymous control channels are allowed (RELAY_ALLOW_ANONYMOUS)");
    }

    let profiles = match &config.profiles_file {
        Some(path) => {
            let store = MemoryProfileStore::load_file(path)?;
            info!("Loaded {} saved profile(s) from {}", store.len(), path);
            store
        }
        None => MemoryProfileStore::new(),
    };

    let broker = ConnectionBroker::new(
        Arc::new(SshConnector::new(config.ssh.clone())),
        Arc::new(MemorySessionRegistry::new(config.session_ttl)),
        Arc::new(profiles),
    );
    let exec = ExecEngine::new(
        broker.clone(),
        Arc::new(TracingAuditStore),
        config.exec_stop_grace,
    );
    let relay = Relay::new(
        broker.clone(),
        exec.clone(),
        Arc::new(StaticTokenVerifier::new(config.auth_tokens.clone())),
        &config,
    );

    let shutdown = CancellationToken::new();
    let reaper = OrphanReaper::new(broker, exec).spawn(config.reaper_interval, shutdown.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Starting SSH relay on {} (control channel at /ws)", addr);

    let result = Server::new(TcpListener::bind(addr))
        .name("SSH Relay")
        .run(server::app(relay))
        .await;

    shutdown.cancel();
    let _ = reaper.await;
    result?;

    Ok(())
}
