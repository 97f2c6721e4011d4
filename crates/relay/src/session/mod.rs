// Session manager: presence, drawing state and chat history for the single
// global drawing session.
//
// Owned exclusively by the hub task, so nothing here locks. Every
// operation returns the effects the hub needs to broadcast and persist.

pub mod drawing;

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use canvasync_common::protocol::ws::{DrawKind, DrawingData};
use canvasync_common::types::{ChatMessage, Stroke, StrokePoint, UserSummary};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broadcast::ConnectionId;
use crate::config::RelayConfig;
use crate::error::ErrorCode;
use crate::persistence::CanvasCommand;
use crate::validation::{
    normalize_brush_size, normalize_color, sanitize_chat_text, sanitize_nickname,
    validate_point, validate_stroke_id, validate_user_id, Limits, ValidationError,
};

pub use drawing::{DrawAccepted, DrawPhase, DrawRejection, DrawingState};

pub const DEFAULT_CHAT_HISTORY: usize = 100;
pub const DEFAULT_CHAT_DEDUP_WINDOW: Duration = Duration::from_secs(2);
pub const DEFAULT_STROKE_HISTORY: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("session is full ({capacity} users)")]
    Full { capacity: usize },
    #[error("user `{0}` is blocked")]
    Blocked(String),
    #[error("user `{0}` is not in the session")]
    UnknownUser(String),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Full { .. } => ErrorCode::SessionFull,
            Self::Blocked(_) => ErrorCode::UserBlocked,
            Self::UnknownUser(_) => ErrorCode::NotJoined,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub capacity: usize,
    pub session_timeout: Duration,
    pub limits: Limits,
    pub chat_history: usize,
    pub chat_dedup_window: Duration,
    pub stroke_history: usize,
    pub blocked_users: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            capacity: 50,
            session_timeout: Duration::from_secs(30 * 60),
            limits: Limits::default(),
            chat_history: DEFAULT_CHAT_HISTORY,
            chat_dedup_window: DEFAULT_CHAT_DEDUP_WINDOW,
            stroke_history: DEFAULT_STROKE_HISTORY,
            blocked_users: Vec::new(),
        }
    }
}

impl From<&RelayConfig> for SessionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            capacity: config.max_users,
            session_timeout: config.session_timeout,
            limits: Limits::from(config),
            blocked_users: config.blocked_users.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct Identity {
    pub user_id: String,
    pub nickname: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen: Instant,
    pub connection: ConnectionId,
    /// Changes on every fresh join, survives reconnects.
    pub join_epoch: u64,
    pub message_count: u64,
    pub drawing_count: u64,
    pub reconnect_count: u32,
    pub drawing: DrawingState,
    last_chat: Option<(String, Instant)>,
}

impl Identity {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.user_id.clone(),
            nickname: self.nickname.clone(),
            joined_at: self.joined_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub user: UserSummary,
    /// Other members in join order.
    pub others: Vec<UserSummary>,
    pub user_count: usize,
    pub reconnected: bool,
    pub join_epoch: u64,
    /// Connection that held this identity before a reconnect.
    pub replaced_connection: Option<ConnectionId>,
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub user_id: String,
    pub nickname: String,
    pub connection: ConnectionId,
    pub user_count: usize,
    /// Persistence effects of force-ending an open stroke.
    pub commands: Vec<CanvasCommand>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub user_id: String,
    pub nickname: String,
    pub joined_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub message_count: u64,
    pub drawing_count: u64,
    pub reconnect_count: u32,
    pub phase: DrawPhase,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub users: Vec<IdentityView>,
    pub user_count: usize,
    pub capacity: usize,
    pub last_sequence: u64,
    pub stroke_history: usize,
    pub chat_messages: usize,
    pub blocked_users: usize,
}

pub struct SessionManager {
    settings: SessionSettings,
    identities: IndexMap<String, Identity>,
    blocklist: HashSet<String>,
    sequence: u64,
    next_epoch: u64,
    stroke_history: VecDeque<Stroke>,
    chat: VecDeque<ChatMessage>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        let blocklist = settings.blocked_users.iter().cloned().collect();
        Self {
            settings,
            identities: IndexMap::new(),
            blocklist,
            sequence: 0,
            next_epoch: 0,
            stroke_history: VecDeque::new(),
            chat: VecDeque::new(),
        }
    }

    /// Continue numbering after a restored canvas.
    pub fn resume_sequence(&mut self, last_sequence: u64) {
        self.sequence = self.sequence.max(last_sequence);
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Issue a sequence number for a canvas mutation made outside `draw`.
    pub fn allocate_sequence(&mut self) -> u64 {
        self.next_sequence()
    }

    // ── Presence ───────────────────────────────────────────────────

    pub fn join(
        &mut self,
        user_id: &str,
        nickname: &str,
        connection: ConnectionId,
    ) -> Result<JoinOutcome, SessionError> {
        let user_id = validate_user_id(user_id)?;
        let nickname = sanitize_nickname(nickname)?;
        if self.blocklist.contains(&user_id) {
            return Err(SessionError::Blocked(user_id));
        }

        let (reconnected, replaced_connection) = match self.identities.get_mut(&user_id) {
            Some(identity) => {
                let previous = identity.connection;
                identity.connection = connection;
                identity.nickname = nickname;
                identity.reconnect_count += 1;
                identity.last_seen = Instant::now();
                info!(user_id = %user_id, reconnects = identity.reconnect_count, "user reconnected");
                (true, (previous != connection).then_some(previous))
            }
            None => {
                if self.identities.len() >= self.settings.capacity {
                    return Err(SessionError::Full { capacity: self.settings.capacity });
                }
                self.next_epoch += 1;
                self.identities.insert(
                    user_id.clone(),
                    Identity {
                        user_id: user_id.clone(),
                        nickname,
                        joined_at: Utc::now(),
                        last_seen: Instant::now(),
                        connection,
                        join_epoch: self.next_epoch,
                        message_count: 0,
                        drawing_count: 0,
                        reconnect_count: 0,
                        drawing: DrawingState::default(),
                        last_chat: None,
                    },
                );
                info!(user_id = %user_id, users = self.identities.len(), "user joined");
                (false, None)
            }
        };

        let identity = self
            .identities
            .get(&user_id)
            .ok_or_else(|| SessionError::UnknownUser(user_id.clone()))?;
        Ok(JoinOutcome {
            user: identity.summary(),
            others: self
                .identities
                .values()
                .filter(|other| other.user_id != user_id)
                .map(Identity::summary)
                .collect(),
            user_count: self.identities.len(),
            reconnected,
            join_epoch: identity.join_epoch,
            replaced_connection,
            chat_history: self.chat.iter().cloned().collect(),
        })
    }

    pub fn leave(&mut self, user_id: &str) -> Result<Departure, SessionError> {
        let mut identity = self
            .identities
            .shift_remove(user_id)
            .ok_or_else(|| SessionError::UnknownUser(user_id.to_string()))?;

        let mut commands = Vec::new();
        if let Some(stroke) = identity.drawing.finish(true, Utc::now()) {
            commands.push(CanvasCommand::EndStroke {
                owner_id: stroke.owner_id.clone(),
                stroke_id: stroke.id.clone(),
                forced: true,
                at: stroke.end_time.unwrap_or_else(Utc::now),
                sequence: self.sequence,
            });
            self.remember_stroke(stroke);
        }
        info!(user_id, users = self.identities.len(), "user left");

        Ok(Departure {
            user_id: identity.user_id,
            nickname: identity.nickname,
            connection: identity.connection,
            user_count: self.identities.len(),
            commands,
        })
    }

    pub fn touch(&mut self, user_id: &str) -> bool {
        match self.identities.get_mut(user_id) {
            Some(identity) => {
                identity.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove identities idle for longer than the session timeout.
    pub fn expire_idle(&mut self, now: Instant) -> Vec<Departure> {
        let timeout = self.settings.session_timeout;
        let idle = self
            .identities
            .values()
            .filter(|identity| now.saturating_duration_since(identity.last_seen) > timeout)
            .map(|identity| identity.user_id.clone())
            .collect::<Vec<_>>();
        idle.iter().filter_map(|user_id| self.leave(user_id).ok()).collect()
    }

    /// Blocklist `user_id`, evicting it when present.
    pub fn block(&mut self, user_id: &str) -> Option<Departure> {
        self.blocklist.insert(user_id.to_string());
        self.leave(user_id).ok()
    }

    pub fn user_for_connection(&self, connection: ConnectionId) -> Option<&Identity> {
        self.identities.values().find(|identity| identity.connection == connection)
    }

    pub fn identity(&self, user_id: &str) -> Option<&Identity> {
        self.identities.get(user_id)
    }

    pub fn roster(&self) -> Vec<UserSummary> {
        self.identities.values().map(Identity::summary).collect()
    }

    pub fn user_count(&self) -> usize {
        self.identities.len()
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence
    }

    // ── Drawing ────────────────────────────────────────────────────

    pub fn draw(&mut self, user_id: &str, data: &DrawingData) -> Result<DrawAccepted, DrawRejection> {
        if !self.identities.contains_key(user_id) {
            return Err(DrawRejection::UnknownUser(user_id.to_string()));
        }
        match data.kind {
            DrawKind::StartDrawing => self.start_stroke(user_id, data),
            DrawKind::Draw => self.append_point(user_id, data),
            DrawKind::EndDrawing => self.end_stroke(user_id, data),
            DrawKind::ClearCanvas => Ok(self.clear(user_id)),
        }
    }

    fn start_stroke(&mut self, user_id: &str, data: &DrawingData) -> Result<DrawAccepted, DrawRejection> {
        let (x, y) = checked_position(data)?;
        let now = Utc::now();
        let sequence = self.next_sequence();
        let stroke_id = data
            .stroke_id
            .as_deref()
            .and_then(|raw| validate_stroke_id(raw).ok())
            .unwrap_or_else(|| format!("{user_id}-{sequence}"));
        let stroke = Stroke {
            id: stroke_id.clone(),
            owner_id: user_id.to_string(),
            color: normalize_color(data.color.as_deref()),
            width: normalize_brush_size(data.size),
            points: vec![StrokePoint { x, y, t: now.timestamp_millis() }],
            completed: false,
            forced_end: false,
            start_time: now,
            end_time: None,
            server_sequence: sequence,
        };

        let mut commands = Vec::new();
        let forced = {
            let identity = self.identity_mut(user_id)?;
            identity.drawing_count += 1;
            identity.drawing.start(stroke.clone(), now)
        };
        if let Some(previous) = forced {
            debug!(user_id, stroke_id = %previous.id, "start mid-stroke, force-ending previous");
            commands.push(CanvasCommand::EndStroke {
                owner_id: previous.owner_id.clone(),
                stroke_id: previous.id.clone(),
                forced: true,
                at: now,
                sequence,
            });
            self.remember_stroke(previous);
        }

        let data = DrawingData {
            kind: DrawKind::StartDrawing,
            normalized_x: Some(x),
            normalized_y: Some(y),
            color: Some(stroke.color.clone()),
            size: Some(stroke.width),
            stroke_id: Some(stroke_id),
        };
        commands.push(CanvasCommand::StartStroke(stroke));
        Ok(DrawAccepted { sequence, data, commands })
    }

    fn append_point(&mut self, user_id: &str, data: &DrawingData) -> Result<DrawAccepted, DrawRejection> {
        let (x, y) = checked_position(data)?;
        let max_points = self.settings.limits.max_stroke_points;
        let max_movement = self.settings.limits.max_point_movement;
        let now = Utc::now();

        let identity = self.identity_mut(user_id)?;
        let point_count = identity.drawing.point_count().ok_or(DrawRejection::NotDrawing)?;
        let point = StrokePoint { x, y, t: now.timestamp_millis() };

        if point_count >= max_points {
            let Some(stroke) = identity.drawing.finish(true, now) else {
                return Err(DrawRejection::NotDrawing);
            };
            let stroke_id = stroke.id.clone();
            let sequence = self.next_sequence();
            let forced_end = DrawAccepted {
                sequence,
                data: DrawingData::new(DrawKind::EndDrawing).with_stroke_id(stroke_id.clone()),
                commands: vec![CanvasCommand::EndStroke {
                    owner_id: user_id.to_string(),
                    stroke_id: stroke_id.clone(),
                    forced: true,
                    at: now,
                    sequence,
                }],
            };
            self.remember_stroke(stroke);
            return Err(DrawRejection::StrokeFull { stroke_id, forced_end: Box::new(forced_end) });
        }

        let stroke = identity.drawing.append(point, max_movement)?;
        let data = DrawingData {
            kind: DrawKind::Draw,
            normalized_x: Some(x),
            normalized_y: Some(y),
            color: Some(stroke.color.clone()),
            size: Some(stroke.width),
            stroke_id: Some(stroke.id.clone()),
        };
        let stroke_id = stroke.id.clone();
        let sequence = self.next_sequence();
        Ok(DrawAccepted {
            sequence,
            data,
            commands: vec![CanvasCommand::AppendPoint { owner_id: user_id.to_string(), stroke_id, point, sequence }],
        })
    }

    fn end_stroke(&mut self, user_id: &str, data: &DrawingData) -> Result<DrawAccepted, DrawRejection> {
        let now = Utc::now();
        let stroke = self
            .identity_mut(user_id)?
            .drawing
            .finish(false, now)
            .ok_or(DrawRejection::NotDrawing)?;
        if data.stroke_id.as_deref().is_some_and(|claimed| claimed != stroke.id) {
            debug!(user_id, stroke_id = %stroke.id, "end names a different stroke, closing active one");
        }

        let stroke_id = stroke.id.clone();
        self.remember_stroke(stroke);
        let sequence = self.next_sequence();
        Ok(DrawAccepted {
            sequence,
            data: DrawingData::new(DrawKind::EndDrawing).with_stroke_id(stroke_id.clone()),
            commands: vec![CanvasCommand::EndStroke {
                owner_id: user_id.to_string(),
                stroke_id,
                forced: false,
                at: now,
                sequence,
            }],
        })
    }

    /// Drop every open stroke. Members mid-stroke must start a new one.
    /// Returns how many strokes were dropped.
    pub fn reset_drawing(&mut self) -> usize {
        let mut dropped = 0;
        for identity in self.identities.values_mut() {
            if identity.drawing.reset().is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    /// Reset every stroke and drawing state. Consumes one sequence number.
    fn clear(&mut self, user_id: &str) -> DrawAccepted {
        self.reset_drawing();
        self.stroke_history.clear();
        let sequence = self.next_sequence();
        info!(user_id, sequence, "canvas cleared");
        DrawAccepted {
            sequence,
            data: DrawingData::new(DrawKind::ClearCanvas),
            commands: vec![CanvasCommand::Clear { sequence }],
        }
    }

    fn identity_mut(&mut self, user_id: &str) -> Result<&mut Identity, DrawRejection> {
        self.identities
            .get_mut(user_id)
            .ok_or_else(|| DrawRejection::UnknownUser(user_id.to_string()))
    }

    fn remember_stroke(&mut self, stroke: Stroke) {
        self.stroke_history.push_back(stroke);
        while self.stroke_history.len() > self.settings.stroke_history {
            self.stroke_history.pop_front();
        }
    }

    pub fn stroke_history(&self) -> impl Iterator<Item = &Stroke> {
        self.stroke_history.iter()
    }

    // ── Chat ───────────────────────────────────────────────────────

    /// Store a chat line. `Ok(None)` when it duplicates the sender's
    /// previous line inside the dedup window.
    pub fn chat(&mut self, user_id: &str, text: &str) -> Result<Option<ChatMessage>, SessionError> {
        self.chat_at(user_id, text, Instant::now())
    }

    pub(crate) fn chat_at(
        &mut self,
        user_id: &str,
        text: &str,
        now: Instant,
    ) -> Result<Option<ChatMessage>, SessionError> {
        let text = sanitize_chat_text(text)?;
        let window = self.settings.chat_dedup_window;
        let identity = self
            .identities
            .get_mut(user_id)
            .ok_or_else(|| SessionError::UnknownUser(user_id.to_string()))?;

        if let Some((previous, at)) = &identity.last_chat {
            if *previous == text && now.saturating_duration_since(*at) < window {
                debug!(user_id, "dropping duplicate chat message");
                return Ok(None);
            }
        }
        identity.last_chat = Some((text.clone(), now));
        identity.message_count += 1;
        identity.last_seen = now;

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            user_id: identity.user_id.clone(),
            nickname: identity.nickname.clone(),
            text,
            timestamp: Utc::now(),
        };
        self.chat.push_back(message.clone());
        while self.chat.len() > self.settings.chat_history {
            self.chat.pop_front();
        }
        Ok(Some(message))
    }

    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.chat.iter().cloned().collect()
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Halve the history buffers and release their spare capacity.
    /// Returns how many entries were dropped.
    pub fn compact(&mut self) -> usize {
        let strokes_keep = self.stroke_history.len() / 2;
        let chat_keep = self.chat.len() / 2;
        let dropped = (self.stroke_history.len() - strokes_keep) + (self.chat.len() - chat_keep);
        self.stroke_history.drain(..self.stroke_history.len() - strokes_keep);
        self.chat.drain(..self.chat.len() - chat_keep);
        self.stroke_history.shrink_to_fit();
        self.chat.shrink_to_fit();
        dropped
    }

    pub fn info(&self) -> SessionInfo {
        let now = Instant::now();
        SessionInfo {
            users: self
                .identities
                .values()
                .map(|identity| IdentityView {
                    user_id: identity.user_id.clone(),
                    nickname: identity.nickname.clone(),
                    joined_at: identity.joined_at,
                    idle_secs: now.saturating_duration_since(identity.last_seen).as_secs(),
                    message_count: identity.message_count,
                    drawing_count: identity.drawing_count,
                    reconnect_count: identity.reconnect_count,
                    phase: identity.drawing.phase(),
                })
                .collect(),
            user_count: self.identities.len(),
            capacity: self.settings.capacity,
            last_sequence: self.sequence,
            stroke_history: self.stroke_history.len(),
            chat_messages: self.chat.len(),
            blocked_users: self.blocklist.len(),
        }
    }
}

fn checked_position(data: &DrawingData) -> Result<(f64, f64), DrawRejection> {
    let (x, y) = data.position().ok_or(DrawRejection::OutOfBounds)?;
    validate_point(x, y).map_err(|_| DrawRejection::OutOfBounds)?;
    Ok((x, y))
}
