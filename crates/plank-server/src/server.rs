use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use plank_core::change::ChangeEntry;
use plank_store::Database;

use crate::client::{self, ClientId, ClientRegistry};
use crate::handlers::HandlerState;
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    /// Callers treat a move with no verdict inside this window as a
    /// transport failure and retry against re-read state.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9272,
            max_send_queue: 256,
            request_timeout_secs: 30,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    change_tx: broadcast::Sender<ChangeEntry>,
) -> Result<ServerHandle, std::io::Error> {
    serve(config, db, change_tx, None).await
}

/// Like `start`, with the telemetry log sink wired into the RPC surface.
pub async fn start_with_telemetry(
    config: ServerConfig,
    db: Database,
    change_tx: broadcast::Sender<ChangeEntry>,
    logs: Arc<plank_telemetry::SqliteLogSink>,
) -> Result<ServerHandle, std::io::Error> {
    serve(config, db, change_tx, Some(logs)).await
}

async fn serve(
    config: ServerConfig,
    db: Database,
    change_tx: broadcast::Sender<ChangeEntry>,
    logs: Option<Arc<plank_telemetry::SqliteLogSink>>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));
    let mut handler_state = HandlerState::new(db, Arc::clone(&registry), change_tx.clone());
    if let Some(logs) = logs {
        handler_state = handler_state.with_logs(logs);
    }
    let handler_state = Arc::new(handler_state);

    // Live fan-out from the change stream to subscribed clients
    let broadcaster_handle = Arc::clone(&handler_state.broadcaster).start(change_tx.subscribe());

    // Dead-client sweeper
    let cleanup_handle = client::start_cleanup_task(
        Arc::clone(&registry),
        std::time::Duration::from_secs(60),
    );

    // RPC message plumbing
    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let rpc_state = Arc::clone(&handler_state);
    let rpc_registry = Arc::clone(&registry);
    let rpc_handle = tokio::spawn(process_rpc_messages(msg_rx, rpc_state, rpc_registry));

    let app_state = AppState {
        handler_state: Arc::clone(&handler_state),
        registry: Arc::clone(&registry),
        message_tx: msg_tx,
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "plank server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        handler_state,
        _server: server_handle,
        _broadcaster: broadcaster_handle,
        _rpc: rpc_handle,
        _cleanup: cleanup_handle,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    pub registry: Arc<ClientRegistry>,
    pub handler_state: Arc<HandlerState>,
    _server: tokio::task::JoinHandle<()>,
    _broadcaster: tokio::task::JoinHandle<()>,
    _rpc: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.registry.register();
    tracing::info!(client_id = %client_id, "WebSocket client connected");

    client::handle_ws_connection(socket, client_id, rx, state.registry, state.message_tx).await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(
        &state.handler_state,
        None,
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    let status = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");

    let http_status = if status == "healthy" {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, axum::Json(resp.result.unwrap_or_default()))
}

/// Process incoming RPC messages from WebSocket clients.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw_message)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw_message) {
            Ok(req) => req,
            Err(_) => {
                let resp = RpcResponse::parse_error();
                if let Ok(json) = serde_json::to_string(&resp) {
                    registry.send_to(&client_id, json).await;
                }
                continue;
            }
        };

        let params = request.params.unwrap_or(serde_json::json!({}));
        let response = crate::handlers::dispatch(
            &state,
            Some(&client_id),
            &request.method,
            &params,
            request.id,
        )
        .await;

        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&client_id, json).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let db = Database::in_memory().unwrap();
        let (change_tx, _) = broadcast::channel(100);

        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };

        let handle = start(config, db, change_tx).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn rpc_processor_answers_over_the_client_queue() {
        let db = Database::in_memory().unwrap();
        let (change_tx, _) = broadcast::channel(100);
        let registry = Arc::new(ClientRegistry::new(32));
        let state = Arc::new(HandlerState::new(db, Arc::clone(&registry), change_tx));

        let (msg_tx, msg_rx) = mpsc::channel(32);
        let _proc = tokio::spawn(process_rpc_messages(
            msg_rx,
            Arc::clone(&state),
            Arc::clone(&registry),
        ));

        let (client_id, mut rx) = registry.register();
        msg_tx
            .send((client_id.clone(), r#"{"method":"system.ping","id":7}"#.into()))
            .await
            .unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["success"], true);

        // Malformed JSON gets a parse error back
        msg_tx
            .send((client_id.clone(), "not json".into()))
            .await
            .unwrap();
        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.contains("PARSE_ERROR"));
    }

    #[test]
    fn build_router_creates_routes() {
        let db = Database::in_memory().unwrap();
        let (change_tx, _) = broadcast::channel(16);
        let registry = Arc::new(ClientRegistry::new(32));
        let handler_state = Arc::new(HandlerState::new(db, Arc::clone(&registry), change_tx));
        let (msg_tx, _) = mpsc::channel(32);

        let state = AppState {
            handler_state,
            registry,
            message_tx: msg_tx,
        };

        let _router = build_router(state);
    }
}
