//! tether-relay: a document relay hub.
//!
//! Accepts WebSocket peers and relays CRDT documents between them. The
//! relay runs as a `service` peer with on-request document creation, so
//! it serves whatever documents its clients bring without any
//! application-level interest of its own.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use clap::Parser;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use tether_core::{AutomergeDoc, PeerIdentity, Synchronizer, SynchronizerConfig};

#[derive(Parser, Debug)]
#[command(name = "tether-relay", about = "Relay hub for tether document sync")]
struct RelayConfig {
    /// Address for the WebSocket listener.
    #[arg(long, default_value = "127.0.0.1:8040", env = "TETHER_LISTEN")]
    listen_addr: String,

    /// Stable peer id for this relay. A random one is generated if unset,
    /// which is fine for single-instance deployments.
    #[arg(long, env = "TETHER_PEER_ID")]
    peer_id: Option<String>,

    /// Display name announced during establishment.
    #[arg(long, default_value = "relay")]
    name: String,

    /// Ephemeral rebroadcast interval in seconds.
    #[arg(long, default_value_t = 15)]
    heartbeat_secs: u64,
}

#[derive(Serialize)]
struct HealthResponse {
    name: String,
    peer_id: String,
    peers: usize,
    channels: usize,
    docs: usize,
}

type Relay = Arc<Synchronizer<AutomergeDoc>>;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (TETHER_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("TETHER_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("tether_relay=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig::parse();
    let peer_id = config
        .peer_id
        .clone()
        .unwrap_or_else(|| format!("relay-{:08x}", rand::random::<u32>()));

    tracing::info!(peer_id = %peer_id, "Starting relay on {}", config.listen_addr);

    let sync: Relay = Arc::new(Synchronizer::spawn(
        SynchronizerConfig::new(PeerIdentity::service(peer_id, config.name.clone()))
            .with_heartbeat_interval(std::time::Duration::from_secs(config.heartbeat_secs)),
    ));

    let app = tether_net::router(sync.adapter_handle())
        .merge(
            axum::Router::new()
                .route("/healthz", get(health))
                .with_state(sync.clone()),
        )
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(sync): State<Relay>) -> Json<HealthResponse> {
    let status = sync.status().await.unwrap_or(tether_core::Status {
        peers: 0,
        channels: 0,
        docs: 0,
    });
    Json(HealthResponse {
        name: sync.identity().name.clone(),
        peer_id: sync.identity().peer_id.to_string(),
        peers: status.peers,
        channels: status.channels,
        docs: status.docs,
    })
}
