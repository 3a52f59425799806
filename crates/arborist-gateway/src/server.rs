use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use arborist_core::{PartEvent, RemoteToolCall, RemoteToolReply};

use crate::auth::{auth_middleware, AuthConfig};
use crate::rate_limiter::{rate_limit_middleware, RateLimiter};
use crate::session_manager::{SessionManager, TurnOutcome};
use crate::types::{ClientMessage, HealthResponse, ServerMessage};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub auth_config: Arc<AuthConfig>,
    pub rate_limiter: Arc<RateLimiter>,
    pub allowed_origins: Vec<String>,
    pub max_message_bytes: usize,
}

/// Build the Axum router: a single bidirectional WebSocket channel, plus
/// a plain `/health` route for load balancer probes.
pub fn create_router(state: AppState) -> Router {
    let cors = if state.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(
                state
                    .allowed_origins
                    .iter()
                    .map(|s| s.parse().unwrap())
                    .collect::<Vec<_>>(),
            )
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let auth_config = state.auth_config.clone();
    let rate_limiter = state.rate_limiter.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn(
            move |addr: ConnectInfo<SocketAddr>, req, next| {
                let rl = rate_limiter.clone();
                async move { rate_limit_middleware(addr, rl, req, next).await }
            },
        ))
        .layer(middleware::from_fn(move |req, next| {
            auth_middleware(auth_config.clone(), req, next)
        }))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!(addr = %addr, "Starting gateway server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Gateway server stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
    info!("Shutdown signal received, draining connections...");
    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
    info!("Drain complete, shutting down");
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

const WS_IDLE_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(300);

async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    use futures_util::{SinkExt, StreamExt};
    use tokio::time::timeout;

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<ServerMessage>(64);
    let (remote_tx, mut remote_rx) = tokio::sync::mpsc::channel::<RemoteToolCall>(16);
    // One interactive session per connection: tracks the id STOP should
    // target. Known immediately when the client resumes an existing session;
    // filled in once the first turn on a brand-new session allocates its id.
    let current_session_id: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));

    // Forward TOOL_CALL envelopes and AGENT_RESPONSE/STOPPED/PONG/ERROR messages to
    // the client over one writer task, so turn-handling tasks never touch the
    // socket directly.
    let forward_tool_calls = out_tx.clone();
    let tool_call_forwarder = tokio::spawn(async move {
        while let Some(call) = remote_rx.recv().await {
            let msg = ServerMessage::ToolCall {
                call_id: call.call_id,
                tool_name: call.tool_name,
                params: call.params,
            };
            if forward_tool_calls.send(msg).await.is_err() {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    loop {
        match timeout(WS_IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if text.len() > state.max_message_bytes {
                    let _ = out_tx
                        .send(ServerMessage::error("PAYLOAD_TOO_LARGE", "message exceeds configured limit"))
                        .await;
                    continue;
                }
                let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
                    let _ = out_tx.send(ServerMessage::error("BAD_MESSAGE", "could not parse message")).await;
                    continue;
                };
                handle_client_message(client_msg, &state, &out_tx, &remote_tx, &current_session_id);
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) => {
                info!("WebSocket error, closing connection");
                break;
            }
            Ok(None) => {
                info!("WebSocket connection closed by client");
                break;
            }
            Err(_) => {
                info!(timeout_secs = WS_IDLE_TIMEOUT.as_secs(), "WebSocket idle timeout, closing connection");
                break;
            }
        }
    }

    tool_call_forwarder.abort();
    writer.abort();
}

fn handle_client_message(
    msg: ClientMessage,
    state: &AppState,
    out_tx: &tokio::sync::mpsc::Sender<ServerMessage>,
    remote_tx: &tokio::sync::mpsc::Sender<RemoteToolCall>,
    current_session_id: &Arc<std::sync::Mutex<Option<String>>>,
) {
    match msg {
        ClientMessage::AgentChat { message, session_id, project_key, .. } => {
            if !session_id.is_empty() {
                *current_session_id.lock().unwrap() = Some(session_id.clone());
            }
            let session_manager = state.session_manager.clone();
            let out_tx = out_tx.clone();
            let remote_tx = remote_tx.clone();
            let current_session_id = current_session_id.clone();
            tokio::spawn(async move {
                let tentative_id = if session_id.is_empty() { "pending".to_string() } else { session_id.clone() };
                let _ = out_tx.send(ServerMessage::processing(&tentative_id)).await;

                // Forward every Part lexed out of this turn's live stream to the
                // client as an AGENT_RESPONSE frame, until the turn signals complete.
                let (part_tx, mut part_rx) = tokio::sync::mpsc::channel::<PartEvent>(32);
                let part_forward_out_tx = out_tx.clone();
                let part_forward_session_id = tentative_id.clone();
                let part_forwarder = tokio::spawn(async move {
                    while let Some(event) = part_rx.recv().await {
                        match event {
                            PartEvent::Emitted(part) => {
                                let _ = part_forward_out_tx
                                    .send(ServerMessage::part_update(&part_forward_session_id, &part))
                                    .await;
                            }
                            PartEvent::Complete { .. } => break,
                        }
                    }
                });

                let outcome = session_manager.run_turn(&session_id, &project_key, &message, &part_tx, &remote_tx).await;
                drop(part_tx);
                let _ = part_forwarder.await;

                match outcome {
                    Ok(TurnOutcome::Completed { session_id, content }) => {
                        *current_session_id.lock().unwrap() = Some(session_id.clone());
                        let _ = out_tx.send(ServerMessage::completed(session_id, content)).await;
                    }
                    Ok(TurnOutcome::Cancelled { session_id }) => {
                        let _ = out_tx.send(ServerMessage::cancelled(session_id)).await;
                    }
                    Ok(TurnOutcome::Failed { session_id, message }) => {
                        *current_session_id.lock().unwrap() = Some(session_id.clone());
                        let _ = out_tx.send(ServerMessage::failed(session_id, message)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "turn rejected");
                        let _ = out_tx.send(ServerMessage::error(e.kind(), e.to_string())).await;
                    }
                }
            });
        }
        ClientMessage::ToolResult { call_id, success, result, error, .. } => {
            state.session_manager.resolve_tool_result(RemoteToolReply {
                call_id,
                result: if success { Some(result) } else { None },
                error: if success { None } else { error },
            });
        }
        ClientMessage::Stop => {
            let session_id = current_session_id.lock().unwrap().clone();
            let out_tx = out_tx.clone();
            let session_manager = state.session_manager.clone();
            tokio::spawn(async move {
                let message = match &session_id {
                    Some(id) if session_manager.stop(id) => "cancelling",
                    _ => "no active turn",
                };
                let _ = out_tx
                    .send(ServerMessage::Stopped {
                        session_id: session_id.unwrap_or_default(),
                        message: message.to_string(),
                    })
                    .await;
            });
        }
        ClientMessage::Ping => {
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let timestamp = chrono::Utc::now().timestamp_millis();
                let _ = out_tx.send(ServerMessage::Pong { timestamp }).await;
            });
        }
    }
}
