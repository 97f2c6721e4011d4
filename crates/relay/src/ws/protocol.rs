use axum::extract::ws::{CloseFrame, Message, WebSocket};
use canvasync_common::protocol::ws::{ClientMessage, ServerMessage};

use crate::broadcast::Outbound;

pub fn decode_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str::<ClientMessage>(raw)
}

pub fn encode_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

pub async fn send_close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
        .await;
}

/// Write one hub frame. `Ok(false)` means the hub closed this socket.
pub async fn send_outbound(socket: &mut WebSocket, outbound: Outbound) -> Result<bool, ()> {
    match outbound {
        Outbound::Message(message) => send_ws_message(socket, &message).await.map(|()| true),
        Outbound::Close { code, reason } => {
            send_close(socket, code, &reason).await;
            Ok(false)
        }
    }
}
