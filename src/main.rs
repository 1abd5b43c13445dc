use std::sync::Arc;

use axum::{routing::get, Json, Router};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coscribe::config::Config;
use coscribe::coordinator::SyncCoordinator;
use coscribe::presence::PresenceRegistry;
use coscribe::store::DocumentStore;
use coscribe::transform::text::TextTransform;
use coscribe::ws::{collab_handler, CollabState, ConnectionEvent, ConnectionManager};

/// Capacity of the connection manager's event inbox.
const EVENT_BUFFER: usize = 1024;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "coscribe=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // The coordinator exclusively owns document and presence state; the
    // manager task is the only thing that ever touches it.
    let store = DocumentStore::new(
        serde_json::Value::String(config.initial_text.clone()),
        Arc::new(TextTransform),
    );
    let presence = PresenceRegistry::new(config.cursor_palette.clone());
    let coordinator = SyncCoordinator::new(store, presence);
    let manager = ConnectionManager::new(coordinator, config.heartbeat());

    let (events, inbox) = mpsc::channel::<ConnectionEvent>(EVENT_BUFFER);
    tokio::spawn(manager.run(inbox));

    let app_routes = Router::new()
        .route("/health", get(health_check))
        .route("/collab", get(collab_handler))
        .with_state(CollabState { events })
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("Server running on http://{}", config.server_address());
    info!(
        "Collaboration endpoint available at ws://{}/collab",
        config.server_address()
    );

    axum::serve(listener, app_routes)
        .await
        .expect("Server failed to start");
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "Server is running"
    }))
}
