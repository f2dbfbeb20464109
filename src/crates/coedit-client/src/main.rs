//! coedit client entry point.
//!
//! Two modes, chosen by the configuration:
//!
//! ```text
//! main()
//!  └─ load_config()
//!  ├─ [client].server set   → join that server and poll until Ctrl-C
//!  │    ├─ ClientSession::connect   (blocking, on the blocking pool)
//!  │    ├─ poll loop                (blocking, every poll_interval_ms)
//!  │    └─ event task               (logs SessionEvent)
//!  └─ otherwise             → browse the LAN until Ctrl-C
//!       ├─ discovery listener thread
//!       └─ event task               (logs RegistryEvent)
//! ```
//!
//! Usage: `coedit-client [CONFIG_PATH]`.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use coedit_client::application::server_browser::{RegistryEvent, ServerRegistry};
use coedit_client::application::sync_state::{OutboundChanges, SessionEvent};
use coedit_client::infrastructure::network::discovery::start_discovery_listener;
use coedit_client::infrastructure::network::session::{ClientSession, ConnectionOutcome};
use coedit_client::infrastructure::storage::config::{default_config_path, load_config, ClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => default_config_path()?,
    };
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    config.validate()?;

    match config.client.server.clone() {
        Some(server) => run_session(config, server).await,
        None => browse(config).await,
    }
}

async fn run_session(config: ClientConfig, server: String) -> anyhow::Result<()> {
    let id = Uuid::new_v4();
    let password = config.client.password.clone();
    let metadata = Some(config.client.name.clone().into_bytes());

    let target = server.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        ClientSession::connect(target.as_str(), id, password, metadata)
    })
    .await?
    .with_context(|| format!("connecting to {server}"))?;

    let (mut session, mut events) = match outcome {
        ConnectionOutcome::Approved {
            session,
            file_path,
            operations,
            events,
        } => {
            info!(
                "editing '{file_path}' as {id}, {} operation(s) to replay",
                operations.len()
            );
            (session, events)
        }
        ConnectionOutcome::Rejected(code) => bail!("{server} rejected the connection: {code:?}"),
    };

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::PeerJoined { id, metadata } => {
                    info!("{} joined", display_name(id, metadata.as_deref()));
                }
                SessionEvent::PeerLeft(id) => info!("{id} left"),
                SessionEvent::MetadataChanged { id, metadata } => {
                    info!("{} updated its metadata", display_name(id, Some(&metadata)));
                }
                SessionEvent::Disconnected => warn!("lost connection to the server"),
            }
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let poll_running = Arc::clone(&running);
    let interval = config.poll_interval();
    let mut poller = tokio::task::spawn_blocking(move || {
        let mut outbound = OutboundChanges::new();
        while poll_running.load(Ordering::SeqCst) {
            match session.sync(&mut outbound) {
                Ok(reply) => {
                    if let Some(ops) = reply.operations() {
                        info!("received {} remote operation(s)", ops.len());
                    }
                }
                Err(e) => {
                    error!("poll failed: {e}");
                    return;
                }
            }
            thread::sleep(interval);
        }
        if let Err(e) = session.disconnect() {
            warn!("disconnect failed: {e}");
        }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
            running.store(false, Ordering::SeqCst);
            (&mut poller).await?;
        }
        joined = &mut poller => joined?,
    }
    Ok(())
}

async fn browse(config: ClientConfig) -> anyhow::Result<()> {
    let (registry, mut events) = ServerRegistry::new(config.staleness());
    let registry = Arc::new(registry);
    let running = Arc::new(AtomicBool::new(true));
    let listener = start_discovery_listener(
        config.network.discovery_port,
        Arc::clone(&registry),
        Arc::clone(&running),
    )?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RegistryEvent::Added(server) | RegistryEvent::Updated(server) => info!(
                    "{} at {}:{}  {}/{} clients{}",
                    server.name(),
                    server.endpoint(),
                    server.port(),
                    server.client_count(),
                    server.max_clients(),
                    if server.requires_password() { "  (password)" } else { "" }
                ),
                RegistryEvent::Inactive(key) => info!("{key} went silent"),
                RegistryEvent::Removed(key) => info!("{key} removed"),
            }
        }
    });

    info!("browsing for servers.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c().await?;
    running.store(false, Ordering::SeqCst);
    if listener.thread.join().is_err() {
        error!("discovery thread panicked");
    }
    Ok(())
}

fn display_name(id: Uuid, metadata: Option<&[u8]>) -> String {
    match metadata.map(String::from_utf8_lossy) {
        Some(name) if !name.is_empty() => format!("{name} ({id})"),
        _ => id.to_string(),
    }
}
