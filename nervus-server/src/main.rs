mod http;
mod push;
mod websocket;
mod websocket_manager;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use nervus_bus::EventBus;
use nervus_core::NervusConfig;
use nervus_distributor::EventDistributor;
use nervus_filter::FilterEngine;
use nervus_metrics::MetricsCollector;
use nervus_store::EventStore;
use push::LoggingPushTransport;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use websocket_manager::WebSocketManager;

#[derive(Parser, Debug)]
#[command(name = "nervus-server", about = "Event distribution core for the memory server")]
struct Args {
    /// Path to a JSON/TOML/YAML config file. Falls back to env-derived defaults when absent.
    #[arg(long)]
    config: Option<String>,

    /// Address to bind the HTTP/WebSocket surface to.
    #[arg(long, default_value = "0.0.0.0:7870")]
    bind: SocketAddr,
}

#[derive(Clone)]
pub struct AppState {
    distributor: Arc<EventDistributor>,
    metrics: Arc<MetricsCollector>,
    ws: Arc<WebSocketManager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            info!(path, "loading configuration from file");
            NervusConfig::from_file(path)?
        }
        None => {
            info!("no --config given, loading configuration from environment");
            NervusConfig::from_env()
        }
    };
    config.validate()?;

    info!("starting event bus");
    let bus = EventBus::new(config.bus.clone());
    bus.start()?;

    info!(db_path = %config.store.db_path, "opening event store");
    let store = EventStore::open(config.store.clone()).await?;

    info!("starting metrics collector");
    let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));

    let filter_engine = FilterEngine::new();

    let ws_manager = Arc::new(WebSocketManager::new());
    let push_transport = Arc::new(LoggingPushTransport::new());

    info!("starting event distributor");
    let distributor = EventDistributor::new(config.distributor.clone())
        .with_bus(bus.clone())
        .with_store(store.clone())
        .with_metrics(metrics.clone())
        .with_filter_engine(filter_engine)
        .with_websocket_transport(ws_manager.clone())
        .with_push_transport(push_transport);
    distributor.start()?;

    let state = AppState { distributor: distributor.clone(), metrics, ws: ws_manager };
    let app = http::create_router(state);

    info!(addr = %args.bind, "starting HTTP/WebSocket server");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    let http_server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "http server exited with error");
        }
    });

    info!("nervus-server ready");
    wait_for_shutdown().await;

    info!("shutting down");
    http_server.abort();
    distributor.stop().await?;
    store.stop().await?;
    bus.stop().await?;
    info!("shutdown complete");

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
