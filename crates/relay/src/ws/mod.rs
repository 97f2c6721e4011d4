// Realtime channel transport.
//
// Each socket gets a connection id and an outbound channel registered with
// the hub. The socket task only decodes, forwards and writes; every state
// change happens in the hub.

pub mod protocol;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{close_code, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header::USER_AGENT, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::broadcast::{Outbound, CLOSE_TRY_AGAIN_LATER};
use crate::error::{
    current_request_id, error_frame, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode,
};
use crate::hub::HubHandle;
use crate::metrics;
use crate::rate_limit::client_identity;
use crate::validation::check_ws_frame_size;

use self::protocol as ws_protocol;

const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone)]
pub struct WsState {
    hub: HubHandle,
    frame_limit: usize,
}

pub fn router(hub: HubHandle, frame_limit: usize) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(WsState { hub, frame_limit })
}

pub async fn ws_upgrade(
    State(state): State<WsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_agent = headers.get(USER_AGENT).and_then(|value| value.to_str().ok()).unwrap_or("");
    let client = client_identity(peer.ip(), user_agent);
    let request_id = request_id_from_headers_or_generate(&headers);
    let frame_limit = state.frame_limit;

    ws.max_frame_size(frame_limit).max_message_size(frame_limit).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state.hub, frame_limit, client, socket)).await;
    })
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket, frame_limit: usize) {
    let reason = format!("websocket frame exceeds maximum size of {frame_limit} bytes");
    ws_protocol::send_close(socket, close_code::SIZE, &reason).await;
}

async fn handle_socket(hub: HubHandle, frame_limit: usize, client: String, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let connection = hub.next_connection_id();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();

    if !hub.connect(connection, client, outbound_sender) {
        ws_protocol::send_close(&mut socket, CLOSE_TRY_AGAIN_LATER, "server is shutting down").await;
        return;
    }
    debug!(connection, request_id = %request_id, "websocket connected");

    // Heartbeat: ping every HEARTBEAT_INTERVAL_MS; a ping left unanswered
    // for HEARTBEAT_TIMEOUT_MS drops the connection.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if awaiting_pong.is_some_and(|since| since.elapsed() > heartbeat_timeout) {
                    warn!(connection, request_id = %request_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong.get_or_insert_with(Instant::now);
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(outbound) = maybe_outbound else { break };
                match ws_protocol::send_outbound(&mut socket, outbound).await {
                    Ok(true) => {}
                    Ok(false) | Err(()) => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else { break };
                match message {
                    Ok(Message::Text(raw_message)) => {
                        awaiting_pong = None;
                        let received_at = Instant::now();
                        if check_ws_frame_size(raw_message.as_bytes(), frame_limit).is_err() {
                            close_frame_too_large(&mut socket, frame_limit).await;
                            break;
                        }

                        match ws_protocol::decode_message(&raw_message) {
                            Ok(inbound) => {
                                if !hub.inbound(connection, inbound, received_at) {
                                    break;
                                }
                            }
                            Err(error) => {
                                debug!(connection, error = %error, "undecodable frame");
                                metrics::record_ws_message("invalid", true, 0);
                                let reply = error_frame(
                                    ErrorCode::InvalidMessage,
                                    ErrorCode::InvalidMessage.default_message(),
                                );
                                if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        metrics::record_ws_message("binary", true, 0);
                        let reply = error_frame(ErrorCode::InvalidMessage, "binary frames are not supported");
                        if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => awaiting_pong = None,
                    Ok(Message::Ping(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(error) if is_frame_size_violation(&error) => {
                        close_frame_too_large(&mut socket, frame_limit).await;
                        break;
                    }
                    Err(error) => {
                        debug!(connection, error = %error, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(connection);
    debug!(connection, request_id = %request_id, "websocket disconnected");
}
