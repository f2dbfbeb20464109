//! coedit server entry point.
//!
//! Loads the configuration, starts the services, and blocks until Ctrl-C.
//!
//! ```text
//! main()
//!  └─ load_config()            -- TOML, defaults on first run
//!  └─ CollaborationHub::new()  -- session state
//!  └─ start services
//!       ├─ ConnectionManager   (TCP accept thread + one thread per client)
//!       └─ announcer           (UDP broadcast thread)
//! ```
//!
//! Usage: `coedit-server [CONFIG_PATH]`.  Without an argument the platform
//! default path is used.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use coedit_server::application::collaboration::{CollaborationHub, HubConfig};
use coedit_server::infrastructure::network::connection_manager::ConnectionManager;
use coedit_server::infrastructure::network::discovery::{start_announcer, AnnounceSettings};
use coedit_server::infrastructure::storage::config::{default_config_path, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => default_config_path()?,
    };
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    config.validate()?;
    info!("coedit server starting with {}", config_path.display());

    let hub = Arc::new(CollaborationHub::new(HubConfig {
        file_path: config.server.file_path.clone(),
        password: config.server.password.clone(),
        max_clients: usize::from(config.server.max_clients),
    })?);
    let server_id = Uuid::new_v4();

    let manager = ConnectionManager::start(config.bind_addr()?, server_id, Arc::clone(&hub))?;

    // ── Announcer ─────────────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let mut settings = AnnounceSettings::broadcast(
        server_id,
        &config.server.name,
        manager.local_addr().port(),
        config.network.discovery_port,
    );
    settings.interval = config.announce_interval();
    let announcer = match start_announcer(settings, Arc::clone(&hub), Arc::clone(&running)) {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("failed to start announcer, clients must connect by address: {e}");
            None
        }
    };

    info!(
        "serving '{}' as {server_id}.  Press Ctrl-C to exit.",
        config.server.file_path
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    running.store(false, Ordering::SeqCst);
    manager.shutdown();
    if let Some(handle) = announcer {
        if handle.join().is_err() {
            error!("announcer thread panicked");
        }
    }

    info!("coedit server stopped");
    Ok(())
}
