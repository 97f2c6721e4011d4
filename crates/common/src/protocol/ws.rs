// WebSocket message types for the canvas realtime channel.
//
// Every frame is a JSON object tagged by `type`. Field names are camelCase
// to match the browser client.

use serde::{Deserialize, Serialize};

use crate::types::{CanvasSnapshot, ChatMessage, Stroke, UserSummary};

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join the peer mesh.
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Opaque negotiation payload for one mesh peer, or all of them.
    #[serde(rename_all = "camelCase")]
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        data: serde_json::Value,
    },

    /// Fallback relay of drawing payloads when no direct link exists.
    Draw { data: serde_json::Value },

    /// Join the drawing session as an identified member.
    #[serde(rename_all = "camelCase")]
    JoinSession { user_id: String, nickname: String },

    /// Leave the drawing session but keep the socket open as an observer.
    LeaveSession,

    /// One step of the drawing protocol.
    DrawingData { data: DrawingData },

    ChatMessage { message: String },

    /// Replace the authoritative canvas with a client-provided state.
    #[serde(rename_all = "camelCase")]
    CanvasState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strokes: Option<Vec<Stroke>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        background: Option<String>,
    },

    RequestCanvasState,

    /// Opaque peer-connection negotiation payload for one session member.
    #[serde(rename_all = "camelCase")]
    WebrtcSignal { target_user_id: String, signal: serde_json::Value },

    Ping,
}

impl ClientMessage {
    /// Event type name used for rate limiting and metrics.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Signal { .. } => "signal",
            Self::Draw { .. } => "draw",
            Self::JoinSession { .. } => "join-session",
            Self::LeaveSession => "leave-session",
            Self::DrawingData { .. } => "drawing-data",
            Self::ChatMessage { .. } => "chat-message",
            Self::CanvasState { .. } => "canvas-state",
            Self::RequestCanvasState => "request-canvas-state",
            Self::WebrtcSignal { .. } => "webrtc-signal",
            Self::Ping => "ping",
        }
    }
}

/// Frames sent by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Joined { room_id: String, client_id: String, peers: Vec<String> },

    #[serde(rename_all = "camelCase")]
    PeerJoin { client_id: String },

    #[serde(rename_all = "camelCase")]
    PeerLeave { client_id: String },

    #[serde(rename_all = "camelCase")]
    Signal {
        from_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        data: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    Draw { from_id: String, data: serde_json::Value },

    #[serde(rename_all = "camelCase")]
    SessionJoined {
        user_id: String,
        users: Vec<UserSummary>,
        user_count: usize,
        #[serde(default)]
        messages: Vec<ChatMessage>,
        #[serde(default)]
        reconnected: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String, nickname: String, user_count: usize },

    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String, nickname: String, user_count: usize },

    #[serde(rename_all = "camelCase")]
    DrawingData { user_id: String, sequence: u64, data: DrawingData },

    ChatMessage(ChatMessage),

    CanvasState(CanvasSnapshot),

    #[serde(rename_all = "camelCase")]
    WebrtcSignal { from_user_id: String, target_user_id: String, signal: serde_json::Value },

    Pong,

    Error { code: String, message: String, retryable: bool },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::PeerJoin { .. } => "peer-join",
            Self::PeerLeave { .. } => "peer-leave",
            Self::Signal { .. } => "signal",
            Self::Draw { .. } => "draw",
            Self::SessionJoined { .. } => "session-joined",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::DrawingData { .. } => "drawing-data",
            Self::ChatMessage(_) => "chat-message",
            Self::CanvasState(_) => "canvas-state",
            Self::WebrtcSignal { .. } => "webrtc-signal",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }
}

/// The `type` of a drawing step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DrawKind {
    #[serde(rename = "startDrawing")]
    StartDrawing,
    #[serde(rename = "draw")]
    Draw,
    #[serde(rename = "endDrawing")]
    EndDrawing,
    #[serde(rename = "clear-canvas")]
    ClearCanvas,
}

/// Payload of a `drawing-data` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrawingData {
    #[serde(rename = "type")]
    pub kind: DrawKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_id: Option<String>,
}

impl DrawingData {
    pub fn new(kind: DrawKind) -> Self {
        Self { kind, normalized_x: None, normalized_y: None, color: None, size: None, stroke_id: None }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.normalized_x = Some(x);
        self.normalized_y = Some(y);
        self
    }

    pub fn with_stroke_id(mut self, stroke_id: impl Into<String>) -> Self {
        self.stroke_id = Some(stroke_id.into());
        self
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        Some((self.normalized_x?, self.normalized_y?))
    }
}
