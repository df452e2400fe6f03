mod commands;
mod config;
mod http;
mod ledger;
mod roles;
mod session;
mod storage;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fedmesh_protocol::{Overlay, OverlayConfig, PeerIdentity, DISCOVERY_TOPIC};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::{Cli, Config, NodeRole};
use http::ControlState;
use ledger::LedgerClient;
use roles::{forward_subscription, NodeEvent};
use storage::ObjectStore;

/// Fatal startup conditions, mapped onto the process exit code contract:
/// 1 config, 2 bootstrap unreachable, 3 ledger unreachable.
enum Fatal {
    Config(String),
    Bootstrap(String),
    Ledger(String),
}

impl Fatal {
    fn code(&self) -> u8 {
        match self {
            Fatal::Config(_) => 1,
            Fatal::Bootstrap(_) => 2,
            Fatal::Ledger(_) => 3,
        }
    }

    fn message(&self) -> &str {
        match self {
            Fatal::Config(m) | Fatal::Bootstrap(m) | Fatal::Ledger(m) => m,
        }
    }
}

fn config_err(e: impl std::fmt::Display) -> Fatal {
    Fatal::Config(e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!(code = fatal.code(), "{}", fatal.message());
            ExitCode::from(fatal.code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    let config = Arc::new(Config::from_cli(cli).map_err(config_err)?);
    tracing::info!(
        role = ?config.role,
        http_port = config.http_port,
        "Starting fedmesh node"
    );

    let identity =
        Arc::new(PeerIdentity::load_or_generate(&config.config_dir).map_err(config_err)?);
    tracing::info!(peer_id = %identity.peer_id(), "Peer identity loaded");

    // External adapters. The bootstrap holds no training state and skips
    // both; for everyone else an unreachable ledger is fatal before any
    // overlay artifact is created.
    let mut ledger: Option<Arc<LedgerClient>> = None;
    let mut store: Option<Arc<ObjectStore>> = None;
    let mut account = None;
    if let (Some(ledger_settings), Some(store_settings)) = (&config.ledger, &config.store) {
        let client = Arc::new(LedgerClient::new(ledger_settings).map_err(config_err)?);
        let tasks = client
            .probe()
            .await
            .map_err(|e| Fatal::Ledger(e.to_string()))?;
        tracing::info!(tasks, "Ledger reachable");
        account = Some(client.operator_address().map_err(config_err)?);
        ledger = Some(client);
        store = Some(Arc::new(ObjectStore::new(store_settings).map_err(config_err)?));
    }

    // Bind the overlay listener before dialing anyone so ephemeral ports
    // are resolved into the advertised address.
    let overlay_listener = TcpListener::bind(&config.overlay_bind_addr())
        .await
        .map_err(config_err)?;
    let overlay_port = overlay_listener.local_addr().map_err(config_err)?.port();
    let public_addr = format!("{}:{overlay_port}", config.node_ip);

    let overlay = Overlay::new(
        OverlayConfig {
            peer_id: identity.peer_id().clone(),
            listen_addr: config.overlay_bind_addr(),
            public_addr: public_addr.clone(),
            role: config.role.into(),
            account,
            bootstrap_addr: config.bootstrap_addr.clone(),
            ..OverlayConfig::default()
        },
        identity,
    );
    tracing::info!(addr = %public_addr, "Overlay listening");

    let serve_overlay = overlay.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_overlay.serve_on(overlay_listener).await {
            tracing::error!(error = %e, "Overlay listener failed");
        }
    });
    tokio::spawn(overlay.clone().run_heartbeat());

    if config.role != NodeRole::Bootstrap {
        overlay
            .bootstrap()
            .await
            .map_err(|e| Fatal::Bootstrap(e.to_string()))?;
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let discovery_rx = overlay.subscribe(DISCOVERY_TOPIC).await;
    forward_subscription(DISCOVERY_TOPIC.to_string(), discovery_rx, events_tx.clone());

    let role_handle = match config.role {
        NodeRole::Bootstrap => {
            tokio::spawn(roles::bootstrap::Bootstrap::new(overlay.clone()).run(events_rx))
        }
        NodeRole::Client => {
            let (ledger, store) = adapters(ledger.clone(), store.clone())?;
            let client = roles::client::Client::new(
                overlay.clone(),
                ledger,
                store,
                config.clone(),
                events_tx.clone(),
            );
            tokio::spawn(client.run(events_rx))
        }
        NodeRole::Trainer => {
            let (ledger, store) = adapters(ledger.clone(), store.clone())?;
            let trainer = roles::trainer::Trainer::new(
                overlay.clone(),
                ledger,
                store,
                config.clone(),
                events_tx.clone(),
            );
            tokio::spawn(trainer.run(events_rx))
        }
    };

    let control = Arc::new(ControlState {
        events: events_tx.clone(),
        store,
        chunk_bytes: config.chunk_bytes,
    });
    let app = http::create_router(control);
    let http_listener = TcpListener::bind(&config.http_bind_addr())
        .await
        .map_err(config_err)?;
    tracing::info!(addr = %config.http_bind_addr(), "Control surface listening");

    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(config_err)?;

    // Drain: the role finishes in-flight work (ledger submissions
    // included) before the process exits.
    let _ = events_tx.send(NodeEvent::Shutdown);
    if tokio::time::timeout(Duration::from_secs(35), role_handle)
        .await
        .is_err()
    {
        tracing::warn!("Role loop did not drain in time");
    }
    tracing::info!("Node shut down");
    Ok(())
}

fn adapters(
    ledger: Option<Arc<LedgerClient>>,
    store: Option<Arc<ObjectStore>>,
) -> Result<(Arc<LedgerClient>, Arc<ObjectStore>), Fatal> {
    match (ledger, store) {
        (Some(ledger), Some(store)) => Ok((ledger, store)),
        _ => Err(Fatal::Config(
            "ledger and object store are required for this role".to_string(),
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
