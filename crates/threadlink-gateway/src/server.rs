//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use threadlink::{Client, ClientOptions, Manager, ThreadGlobal};
use tokio::sync::Mutex;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Requests handled at once before callers queue.
const MAX_CONCURRENT_REQUESTS: usize = 64;

/// Application state shared across handlers.
pub struct AppState {
    /// Context the gateway's Clients live in
    pub root: ThreadGlobal,
    /// Spawns the hosting contexts on demand
    pub manager: Manager,
    /// One Client per Service name
    clients: Mutex<HashMap<String, Client>>,
}

impl AppState {
    pub fn new(root: ThreadGlobal, manager: Manager) -> Self {
        Self {
            root,
            manager,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The cached Client for `service`, created on first use.
    pub async fn client(&self, service: &str) -> Client {
        let mut clients = self.clients.lock().await;
        clients
            .entry(service.to_string())
            .or_insert_with(|| Client::new(&self.root, service, ClientOptions::default()))
            .clone()
    }

    /// Remove the cached Client for `service`.
    pub async fn take_client(&self, service: &str) -> Option<Client> {
        self.clients.lock().await.remove(service)
    }
}

/// Start the JSON-RPC HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    root: ThreadGlobal,
    manager: Manager,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState::new(root, manager));

    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("Server error: {}", err);
        }
    });

    Ok(actual_addr)
}
