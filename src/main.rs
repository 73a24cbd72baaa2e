//! DocSync Relay - realtime document relay with backend persistence
//!
//! Peers editing the same document join one room over WebSocket:
//! - Automerge CRDT per room, loaded once from the HTTP backend
//! - Updates merged and relayed between peers over a binary protocol
//! - Periodic and last-peer saves back to the backend, with a sled outbox
//!   for saves the backend could not take

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

mod backend;
mod config;
mod relay;
mod storage;

use backend::BackendPool;
use config::{PoolingPolicy, RelayConfig};
use relay::{
    protocol::{ClientMessage, ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION},
    room::{Room, RoomInfo},
    ConnectionParams, RelayError, RoomRegistry,
};
use storage::SaveOutbox;

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Live rooms and their backend pool
    registry: Arc<RoomRegistry>,
    /// Server start time
    started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_rooms: usize,
    connected_peers: usize,
    pending_saves: usize,
    backend_pooling: PoolingPolicy,
    backend_handles_issued: usize,
    backend_clients: usize,
}

#[derive(Debug, Serialize)]
struct RoomListResponse {
    rooms: Vec<RoomInfo>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct FlushResponse {
    doc_id: String,
    saved: bool,
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    let pool = state.registry.pool();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_rooms: stats.active_rooms,
        connected_peers: stats.connected_peers,
        pending_saves: stats.pending_saves,
        backend_pooling: pool.policy(),
        backend_handles_issued: pool.handles_issued(),
        backend_clients: pool.clients_created(),
    })
}

/// List active rooms
async fn list_rooms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rooms = state.registry.rooms_info();
    let total = rooms.len();
    Json(RoomListResponse { rooms, total })
}

/// Save a room right away
async fn flush_room(
    Path(doc_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<FlushResponse>, (StatusCode, String)> {
    match state.registry.flush(&doc_id).await {
        Ok(saved) => Ok(Json(FlushResponse { doc_id, saved })),
        Err(e @ RelayError::RoomNotFound(_)) => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e @ RelayError::SaveFailed { .. }) => Err((StatusCode::BAD_GATEWAY, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler.
///
/// The document is always identified by the `doc_id` query parameter, also
/// on the `/parties/:party/:room` route.
async fn ws_handler(
    ws: WebSocketUpgrade,
    uri: Uri,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match ConnectionParams::from_uri(&uri) {
        Ok(params) => {
            debug!(doc_id = params.doc_id(), "WebSocket upgrade request");
            ws.on_upgrade(move |socket| handle_websocket(socket, params, state))
        }
        Err(e) => {
            warn!(path = uri.path(), error = %e, "Rejecting connection");
            let reason = e.to_string();
            ws.on_upgrade(move |socket| close_with(socket, close_code::POLICY, reason))
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: String) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, params: ConnectionParams, state: Arc<AppState>) {
    let doc_id = params.doc_id().to_string();

    let relay = match state.registry.relay_for(params) {
        Ok(relay) => relay,
        Err(e) => {
            error!(doc_id, error = %e, "Failed to obtain backend handle");
            close_with(socket, close_code::ERROR, "backend unavailable".to_string()).await;
            return;
        }
    };

    // Create channel for sending messages to this peer
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let (room, peer) = match state.registry.join(relay, tx).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(doc_id, error = %e, "Join failed");
            let (code, close) = match e {
                RelayError::RoomFull(_) => (ErrorCode::RoomFull, close_code::AGAIN),
                _ => (ErrorCode::ServerError, close_code::ERROR),
            };
            let mut socket = socket;
            if let Ok(bytes) =
                SyncProtocol::encode_server(&SyncProtocol::error_response(code, e.to_string()))
            {
                let _ = socket.send(Message::Binary(bytes.to_vec())).await;
            }
            close_with(socket, close, e.to_string()).await;
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let peer_id = peer.peer_id.clone();

    // Replies switch to JSON text frames once the peer speaks JSON
    let json_mode = Arc::new(AtomicBool::new(false));

    // Task to forward messages from channel to WebSocket
    let json_send = json_mode.clone();
    let peer_id_send = peer_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = if json_send.load(Ordering::Relaxed) {
                SyncProtocol::encode_server_json(&msg).map(Message::Text)
            } else {
                SyncProtocol::encode_server(&msg).map(|bytes| Message::Binary(bytes.to_vec()))
            };
            match frame {
                Ok(frame) => {
                    if ws_sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer_id = %peer_id_send, error = %e, "Failed to encode message");
                }
            }
        }
        debug!(peer_id = %peer_id_send, "Send task ended");
    });

    // Task to handle incoming WebSocket messages
    let room_recv = room.clone();
    let peer_id_recv = peer_id.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut reason = None;
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let decoded = match msg {
                Message::Binary(data) => SyncProtocol::decode_client(&data),
                Message::Text(text) => {
                    json_mode.store(true, Ordering::Relaxed);
                    SyncProtocol::decode_client_json(&text)
                }
                Message::Close(frame) => {
                    reason = frame.map(|f| f.reason.to_string());
                    break;
                }
                // Ping/pong frames are answered by the WebSocket layer
                _ => continue,
            };

            match decoded {
                Ok(ClientMessage::Goodbye { reason: goodbye }) => {
                    reason = goodbye;
                    break;
                }
                Ok(client_msg) => handle_client_message(client_msg, &room_recv, &peer_id_recv),
                Err(e) => {
                    warn!(peer_id = %peer_id_recv, error = %e, "Failed to decode message");
                    room_recv.send_to(
                        &peer_id_recv,
                        SyncProtocol::error_response(ErrorCode::InvalidMessage, e.to_string()),
                    );
                }
            }
        }
        debug!(peer_id = %peer_id_recv, "Receive task ended");
        reason
    });

    // Wait for either task to complete
    let reason = tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            None
        }
        result = &mut recv_task => {
            send_task.abort();
            result.ok().flatten()
        }
    };

    // Cleanup
    state.registry.leave(&room, &peer_id, reason).await;
    info!(doc_id, peer_id, "Peer disconnected");
}

/// Handle a decoded client message
fn handle_client_message(msg: ClientMessage, room: &Room, peer_id: &str) {
    match msg {
        ClientMessage::Update { update } => {
            if let Err(e) = room.apply_update(peer_id, &update) {
                warn!(doc_id = room.doc_id(), peer_id, error = %e, "Rejected update");
                room.send_to(
                    peer_id,
                    SyncProtocol::error_response(ErrorCode::InvalidUpdate, e.to_string()),
                );
            }
        }

        ClientMessage::SyncRequest => {
            if let Some(state) = room.full_state() {
                room.send_to(
                    peer_id,
                    ServerMessage::Update {
                        update: state,
                        from_peer: None,
                    },
                );
            }
        }

        ClientMessage::Ping { timestamp } => {
            room.send_to(
                peer_id,
                ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp(),
                },
            );
        }

        // Handled by the receive loop
        ClientMessage::Goodbye { .. } => {}
    }
}

// ============================================================================
// ROUTER
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Room inspection
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms/:doc_id/save", post(flush_room))
        // WebSocket endpoints
        .route("/ws", get(ws_handler))
        .route("/parties/:party/:room", get(ws_handler))
        // Add state and middleware
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsync_relay=info,tower_http=info".into()),
        )
        .init();

    let config = RelayConfig::from_env()?;

    let outbox = if config.outbox.enabled {
        info!(path = %config.outbox.path, "Opening save outbox");
        let outbox = SaveOutbox::open(&config.outbox.path)?;
        if !outbox.is_empty() {
            info!(pending = outbox.len(), "Outbox has undelivered saves");
        }
        Some(outbox)
    } else {
        warn!("Save outbox disabled - failed saves are kept only in memory");
        None
    };

    let pool = Arc::new(BackendPool::http(config.backend.clone())?);
    let registry = Arc::new(RoomRegistry::new(config.rooms.clone(), pool, outbox));

    // Start background tasks
    let background = registry
        .clone()
        .start_background_tasks(config.outbox.replay_interval);

    let app = build_router(Arc::new(AppState::new(registry.clone())));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol_version = PROTOCOL_VERSION,
        %addr,
        backend = %config.backend.base_url,
        pooling = ?config.backend.pooling,
        "DocSync relay starting"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown();
    background.wait().await;
    info!("DocSync relay stopped");
    Ok(())
}
