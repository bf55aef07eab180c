//! Oracle Coordinator Server
//!
//! Runs the request ledger, aggregator and fulfillment gateway behind an
//! HTTP API, hosts any locally configured node agents, and supervises the
//! maintenance loop that expires overdue requests.

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oracle_coordinator::app_state::AppState;
use oracle_coordinator::callback::{CallbackDispatcher, HttpCallbackDispatcher, LoggingDispatcher};
use oracle_coordinator::config::{CoordinatorConfig, NodeConfig};
use oracle_coordinator::coordinator::Coordinator;
use oracle_coordinator::fetcher::HttpFetcher;
use oracle_coordinator::ledger::load_snapshot;
use oracle_coordinator::models::NodeId;
use oracle_coordinator::node::{Ed25519Signer, NodeAgent, ResponseSigner, ResponseSink};
use oracle_coordinator::routes;
use oracle_coordinator::time::{SharedClock, SystemClock};
use oracle_coordinator::treasury::InMemoryTreasury;

const MAINTENANCE_SUPERVISOR_MAX_BACKOFF_SECONDS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CoordinatorConfig::from_env();
    config.validate().context("invalid coordinator configuration")?;

    let clock: SharedClock = Arc::new(SystemClock);
    let dispatcher: Arc<dyn CallbackDispatcher> = match &config.callback_endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "delivering callbacks over HTTP");
            Arc::new(HttpCallbackDispatcher::new(endpoint.clone()))
        }
        None => {
            warn!("ORACLE_CALLBACK_ENDPOINT not set; callbacks are only logged");
            Arc::new(LoggingDispatcher)
        }
    };

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        clock.clone(),
        Arc::new(InMemoryTreasury::new()),
        dispatcher,
    ));

    if let Some(path) = &config.ledger_snapshot {
        match load_snapshot(path).await {
            Ok(Some(snapshot)) => {
                coordinator.ledger().restore(snapshot);
            }
            Ok(None) => info!(path = %path.display(), "no ledger snapshot yet"),
            Err(err) => warn!(error = %err, "ignoring unreadable ledger snapshot"),
        }
    }

    for key in &config.admitted_nodes {
        if let Err(err) = coordinator.registry().admit(NodeId(key.clone())) {
            warn!(node_id = %key, error = %err, "skipping invalid node key");
        }
    }

    start_local_nodes(&config, &coordinator, &clock)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(supervise_maintenance(
        coordinator.clone(),
        config.maintenance_interval,
        shutdown_rx,
    ));

    let app = routes::router(AppState::new(coordinator.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    shutdown_tx.send(true).ok();
    if let Err(err) = supervisor.await {
        error!(error = %err, "maintenance supervisor failed");
    }
    Ok(())
}

/// Spawn one node agent per configured env prefix.
fn start_local_nodes(
    config: &CoordinatorConfig,
    coordinator: &Arc<Coordinator>,
    clock: &SharedClock,
) -> Result<()> {
    for prefix in &config.local_nodes {
        let Some(node_config) = NodeConfig::from_env_prefixed(prefix, config) else {
            warn!(prefix = %prefix, "no signing seed configured; node not started");
            continue;
        };
        let seed = node_config.signing_seed.clone().unwrap_or_default();
        let signer = Ed25519Signer::from_seed_hex(&seed)
            .with_context(|| format!("invalid signing seed for node {prefix}"))?;
        coordinator.registry().admit(signer.node_id())?;

        let sink: Arc<dyn ResponseSink> = coordinator.clone();
        let agent = Arc::new(NodeAgent::new(
            node_config,
            Arc::new(signer),
            Arc::new(HttpFetcher::new(config.max_response_bytes)),
            sink,
            clock.clone(),
        ));
        info!(prefix = %prefix, node_id = %agent.node_id(), "local node agent configured");
        tokio::spawn(agent.run(coordinator.ledger().clone()));
    }
    Ok(())
}

/// Keep the maintenance loop alive, restarting it with backoff if it panics.
async fn supervise_maintenance(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let mut restart_count: u32 = 0;
    loop {
        let handle = tokio::spawn(coordinator.clone().run_maintenance(interval, shutdown.clone()));

        match handle.await {
            Ok(()) => {
                info!("maintenance loop exited cleanly; stopping supervisor");
                break;
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    error!("maintenance loop panicked; restarting");
                } else {
                    error!(error = %join_error, "maintenance task failed; restarting");
                }
            }
        }

        restart_count = restart_count.saturating_add(1);
        let backoff_seconds = (2u64.saturating_pow(restart_count.min(5)))
            .min(MAINTENANCE_SUPERVISOR_MAX_BACKOFF_SECONDS);
        warn!(restart_count, backoff_seconds, "maintenance loop restart backoff");
        sleep(Duration::from_secs(backoff_seconds)).await;
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

fn build_cors_layer() -> CorsLayer {
    let allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
        .split(',')
        .filter_map(|origin| origin.trim().parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(false)
}
