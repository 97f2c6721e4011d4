// The hub: one task owning session, rate-limit and routing state.
//
// Connections never touch that state directly. They post `HubCommand`s to
// an unbounded channel and receive frames on their own outbound channel.
// Each command runs to completion before the next is dequeued. Disk I/O is
// handed to the canvas store, which runs it on blocking workers, so the
// hub never awaits anything but its inbox.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canvasync_common::protocol::ws::{ClientMessage, DrawingData, ServerMessage};
use canvasync_common::types::{CanvasSnapshot, Stroke};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{
    BroadcastRouter, ConnectionId, OutboundSender, CLOSE_GOING_AWAY, CLOSE_REPLACED,
    CLOSE_TRY_AGAIN_LATER,
};
use crate::error::{error_frame, ErrorCode};
use crate::memory::GovernorHandle;
use crate::metrics;
use crate::persistence::{CanvasCommand, CanvasStore, PersistenceError};
use crate::rate_limit::{Admission, RateLimiter, RateTable};
use crate::session::{
    DrawAccepted, DrawRejection, Departure, SessionError, SessionInfo, SessionManager,
    SessionSettings,
};
use crate::validation::{validate_signal_payload, ValidationError};

#[derive(Debug)]
pub enum HubCommand {
    Connect { connection: ConnectionId, client: String, sender: OutboundSender },
    Inbound { connection: ConnectionId, message: ClientMessage, received_at: Instant },
    Disconnect { connection: ConnectionId },
    /// Posted by the memory governor when a member's resource goes stale.
    Evict { user_id: String, join_epoch: u64 },
    Compact,
    ShedObservers { limit: usize },
    Sweep,
    Info { reply: oneshot::Sender<HubInfo> },
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubInfo {
    pub session: SessionInfo,
    pub connections: usize,
    pub members: usize,
    pub observers: usize,
    pub peers: usize,
    pub rate_buckets: usize,
    pub blocked_buckets: usize,
}

/// Cloneable entry point into the hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    next_connection: Arc<AtomicU64>,
}

impl HubHandle {
    /// A handle whose commands land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<HubCommand>) {
        let (commands, inbox) = mpsc::unbounded_channel();
        (Self { commands, next_connection: Arc::new(AtomicU64::new(0)) }, inbox)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn post(&self, command: HubCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn connect(&self, connection: ConnectionId, client: String, sender: OutboundSender) -> bool {
        self.post(HubCommand::Connect { connection, client, sender })
    }

    pub fn inbound(&self, connection: ConnectionId, message: ClientMessage, received_at: Instant) -> bool {
        self.post(HubCommand::Inbound { connection, message, received_at })
    }

    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        self.post(HubCommand::Disconnect { connection })
    }

    pub fn compact(&self) -> bool {
        self.post(HubCommand::Compact)
    }

    pub fn shed_observers(&self, limit: usize) -> bool {
        self.post(HubCommand::ShedObservers { limit })
    }

    pub fn sweep(&self) -> bool {
        self.post(HubCommand::Sweep)
    }

    pub async fn info(&self) -> Option<HubInfo> {
        let (reply, response) = oneshot::channel();
        if !self.post(HubCommand::Info { reply }) {
            return None;
        }
        response.await.ok()
    }

    /// Ask the hub to end every session and close every socket. Resolves
    /// once the hub has stopped.
    pub async fn shutdown(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if !self.post(HubCommand::Shutdown { reply }) {
            return false;
        }
        response.await.is_ok()
    }
}

pub struct HubSettings {
    pub session: SessionSettings,
    pub rates: RateTable,
    pub canvas_id: String,
    /// Sequence to continue from after a restart.
    pub resume_sequence: u64,
}

/// Start the hub task.
pub fn spawn_hub(
    settings: HubSettings,
    store: CanvasStore,
    governor: GovernorHandle,
) -> (HubHandle, JoinHandle<()>) {
    let (commands, mut inbox) = mpsc::unbounded_channel();
    let mut hub = Hub::new(settings, store, governor, commands.downgrade());
    let handle = HubHandle { commands, next_connection: Arc::new(AtomicU64::new(0)) };

    let task = tokio::spawn(async move {
        while let Some(command) = inbox.recv().await {
            if hub.handle(command).is_break() {
                break;
            }
        }
        debug!("hub stopped");
    });
    (handle, task)
}

/// Periodic idle-session and rate-bucket sweep.
pub fn spawn_sweeper(
    hub: HubHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !hub.sweep() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[derive(Debug)]
struct Rejection {
    code: ErrorCode,
    message: String,
}

impl Rejection {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    fn frame(self) -> ServerMessage {
        error_frame(self.code, self.message)
    }
}

impl From<SessionError> for Rejection {
    fn from(error: SessionError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl From<ValidationError> for Rejection {
    fn from(error: ValidationError) -> Self {
        Self::new(ErrorCode::ValidationFailed, error.to_string())
    }
}

impl From<PersistenceError> for Rejection {
    fn from(error: PersistenceError) -> Self {
        match error {
            PersistenceError::Invalid(error) => error.into(),
            other => Self::new(ErrorCode::PersistenceFailed, other.to_string()),
        }
    }
}

fn user_resource(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub(crate) struct Hub {
    session: SessionManager,
    limiter: RateLimiter,
    router: BroadcastRouter,
    store: CanvasStore,
    governor: GovernorHandle,
    canvas_id: String,
    /// Rate-limit identity per connection.
    clients: HashMap<ConnectionId, String>,
    inbox: mpsc::WeakUnboundedSender<HubCommand>,
}

impl Hub {
    pub(crate) fn new(
        settings: HubSettings,
        store: CanvasStore,
        governor: GovernorHandle,
        inbox: mpsc::WeakUnboundedSender<HubCommand>,
    ) -> Self {
        let mut session = SessionManager::new(settings.session);
        session.resume_sequence(settings.resume_sequence);
        Self {
            session,
            limiter: RateLimiter::new(settings.rates),
            router: BroadcastRouter::new(),
            store,
            governor,
            canvas_id: settings.canvas_id,
            clients: HashMap::new(),
            inbox,
        }
    }

    pub(crate) fn handle(&mut self, command: HubCommand) -> ControlFlow<()> {
        match command {
            HubCommand::Connect { connection, client, sender } => {
                let client_id = self.router.register(connection, sender);
                debug!(connection, client_id = %client_id, "connection registered");
                self.clients.insert(connection, client);
            }
            HubCommand::Inbound { connection, message, received_at } => {
                self.on_inbound(connection, message, received_at);
            }
            HubCommand::Disconnect { connection } => self.on_disconnect(connection),
            HubCommand::Evict { user_id, join_epoch } => self.on_evict(&user_id, join_epoch),
            HubCommand::Compact => {
                let dropped = self.session.compact();
                info!(dropped, "compacted session history");
            }
            HubCommand::ShedObservers { limit } => {
                let shed = self.router.shed_observers(limit);
                for connection in &shed {
                    self.clients.remove(connection);
                }
                if !shed.is_empty() {
                    warn!(shed = shed.len(), "disconnected observers under memory pressure");
                }
            }
            HubCommand::Sweep => self.sweep(Instant::now()),
            HubCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
            HubCommand::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        metrics::set_presence(
            self.router.connection_count(),
            self.router.member_count(),
            self.router.observer_count(),
        );
        ControlFlow::Continue(())
    }

    fn info(&self) -> HubInfo {
        HubInfo {
            session: self.session.info(),
            connections: self.router.connection_count(),
            members: self.router.member_count(),
            observers: self.router.observer_count(),
            peers: self.router.peer_count(),
            rate_buckets: self.limiter.tracked_buckets(),
            blocked_buckets: self.limiter.blocked_buckets(),
        }
    }

    // ── Inbound dispatch ───────────────────────────────────────────

    fn on_inbound(&mut self, connection: ConnectionId, message: ClientMessage, received_at: Instant) {
        let event = message.event_type();
        let Some(client) = self.clients.get(&connection) else {
            debug!(connection, event, "frame from unregistered connection");
            return;
        };

        if let Admission::Limited { newly_blocked, retry_after } = self.limiter.check(client, event) {
            metrics::record_rate_limited(event);
            if newly_blocked {
                warn!(connection, event, retry_after_secs = retry_after.as_secs(), "client rate limited");
                self.router.send_to(
                    connection,
                    error_frame(
                        ErrorCode::RateLimited,
                        format!("too many {event} events, retry in {}s", retry_after.as_secs().max(1)),
                    ),
                );
            }
            metrics::record_ws_message(event, true, elapsed_ms(received_at));
            return;
        }

        if let Some(user_id) = self.router.member_of(connection).map(str::to_string) {
            self.session.touch(&user_id);
            self.governor.touch(&user_resource(&user_id));
        }

        let result = match message {
            ClientMessage::JoinSession { user_id, nickname } => {
                self.join_session(connection, &user_id, &nickname)
            }
            ClientMessage::LeaveSession => self.leave_session(connection),
            ClientMessage::DrawingData { data } => self.drawing_data(connection, &data),
            ClientMessage::ChatMessage { message } => self.chat(connection, &message),
            ClientMessage::CanvasState { strokes, image_data, background } => {
                self.save_canvas_state(connection, strokes, image_data, background)
            }
            ClientMessage::RequestCanvasState => {
                let snapshot = self.current_canvas();
                self.router.send_to(connection, ServerMessage::CanvasState(snapshot));
                Ok(())
            }
            ClientMessage::WebrtcSignal { target_user_id, signal } => {
                self.webrtc_signal(connection, &target_user_id, signal)
            }
            ClientMessage::Join { room_id } => {
                if let Some(joined) = self.router.join_mesh(connection, room_id) {
                    self.router.send_to(connection, joined);
                }
                Ok(())
            }
            ClientMessage::Signal { target_id, data } => validate_signal_payload(&data)
                .map(|()| {
                    self.router.mesh_signal(connection, target_id, data);
                })
                .map_err(Rejection::from),
            ClientMessage::Draw { data } => validate_signal_payload(&data)
                .map(|()| {
                    self.router.mesh_draw(connection, data);
                })
                .map_err(Rejection::from),
            ClientMessage::Ping => {
                self.router.send_to(connection, ServerMessage::Pong);
                Ok(())
            }
        };

        let is_error = result.is_err();
        if let Err(rejection) = result {
            debug!(connection, event, code = rejection.code.as_str(), message = %rejection.message, "rejected");
            self.router.send_to(connection, rejection.frame());
        }
        metrics::record_ws_message(event, is_error, elapsed_ms(received_at));
    }

    fn require_member(&self, connection: ConnectionId) -> Result<String, Rejection> {
        self.router
            .member_of(connection)
            .map(str::to_string)
            .ok_or_else(|| Rejection::new(ErrorCode::NotJoined, ErrorCode::NotJoined.default_message()))
    }

    fn join_session(&mut self, connection: ConnectionId, user_id: &str, nickname: &str) -> Result<(), Rejection> {
        // Switching identities on one socket leaves the old one first.
        if let Some(current) = self.router.member_of(connection).map(str::to_string) {
            if current != user_id.trim() {
                if let Ok(departure) = self.session.leave(&current) {
                    self.depart(departure);
                }
            }
        }

        let outcome = self.session.join(user_id, nickname, connection)?;
        let user_id = outcome.user.user_id.clone();

        if let Some(previous) = outcome.replaced_connection {
            info!(user_id = %user_id, previous, connection, "connection replaced");
            self.router.close(previous, CLOSE_REPLACED, "replaced by a newer connection");
            self.clients.remove(&previous);
        }
        self.router.bind_member(&user_id, connection);

        if outcome.reconnected {
            self.governor.touch(&user_resource(&user_id));
        } else {
            let inbox = self.inbox.clone();
            let evicted = user_id.clone();
            let join_epoch = outcome.join_epoch;
            self.governor.register(user_resource(&user_id), move || {
                if let Some(inbox) = inbox.upgrade() {
                    let _ = inbox.send(HubCommand::Evict { user_id: evicted, join_epoch });
                }
            });
        }

        let announcement = (!outcome.reconnected).then(|| ServerMessage::UserJoined {
            user_id: user_id.clone(),
            nickname: outcome.user.nickname.clone(),
            user_count: outcome.user_count,
        });
        let own_frames = vec![
            ServerMessage::SessionJoined {
                user_id: user_id.clone(),
                users: outcome.others,
                user_count: outcome.user_count,
                messages: outcome.chat_history,
                reconnected: outcome.reconnected,
            },
            ServerMessage::CanvasState(self.current_canvas()),
        ];
        self.router.announce_join(connection, &user_id, own_frames, announcement);
        Ok(())
    }

    fn leave_session(&mut self, connection: ConnectionId) -> Result<(), Rejection> {
        let user_id = self.require_member(connection)?;
        let departure = self.session.leave(&user_id)?;
        self.depart(departure);
        Ok(())
    }

    /// Persist the departure's forced stroke ends, demote its connection
    /// and tell the remaining members.
    fn depart(&mut self, departure: Departure) {
        self.apply_commands(departure.commands);
        self.router.unbind_member(&departure.user_id);
        // The release posts an Evict that no longer matches anything.
        self.governor.unregister(&user_resource(&departure.user_id));
        self.router.broadcast_members(
            ServerMessage::UserLeft {
                user_id: departure.user_id,
                nickname: departure.nickname,
                user_count: departure.user_count,
            },
            None,
        );
    }

    fn drawing_data(&mut self, connection: ConnectionId, data: &DrawingData) -> Result<(), Rejection> {
        let user_id = self.require_member(connection)?;
        match self.session.draw(&user_id, data) {
            Ok(accepted) => {
                self.publish_drawing(&user_id, accepted, Some(connection));
                Ok(())
            }
            Err(DrawRejection::StrokeFull { stroke_id, forced_end }) => {
                metrics::record_draw_rejection("stroke_full");
                // The sender hears about the forced end too.
                self.publish_drawing(&user_id, *forced_end, None);
                Err(Rejection::new(
                    ErrorCode::ValidationFailed,
                    format!("stroke `{stroke_id}` reached its point limit"),
                ))
            }
            Err(rejection) if rejection.is_soft() => {
                metrics::record_draw_rejection(rejection.reason());
                debug!(user_id = %user_id, reason = rejection.reason(), "dropping drawing event");
                Ok(())
            }
            Err(rejection) => {
                metrics::record_draw_rejection(rejection.reason());
                let code = match rejection {
                    DrawRejection::UnknownUser(_) => ErrorCode::NotJoined,
                    _ => ErrorCode::ValidationFailed,
                };
                Err(Rejection::new(code, rejection.to_string()))
            }
        }
    }

    fn publish_drawing(&mut self, user_id: &str, accepted: DrawAccepted, exclude: Option<ConnectionId>) {
        self.apply_commands(accepted.commands);
        self.router.broadcast(
            ServerMessage::DrawingData {
                user_id: user_id.to_string(),
                sequence: accepted.sequence,
                data: accepted.data,
            },
            exclude,
        );
    }

    fn chat(&mut self, connection: ConnectionId, text: &str) -> Result<(), Rejection> {
        let user_id = self.require_member(connection)?;
        if let Some(message) = self.session.chat(&user_id, text)? {
            self.router.broadcast_members(ServerMessage::ChatMessage(message), None);
        }
        Ok(())
    }

    fn save_canvas_state(
        &mut self,
        connection: ConnectionId,
        strokes: Option<Vec<Stroke>>,
        image_data: Option<String>,
        background: Option<String>,
    ) -> Result<(), Rejection> {
        let user_id = self.require_member(connection)?;
        let mut snapshot = self.current_canvas();
        if let Some(strokes) = strokes {
            snapshot.strokes = strokes;
        }
        if image_data.is_some() {
            snapshot.image_data = image_data;
        }
        if let Some(background) = background {
            snapshot.background = background;
        }
        let sequence = self.session.allocate_sequence();
        snapshot.last_sequence = sequence;
        self.store.save_canvas_state(&self.canvas_id, snapshot)?;
        // Open strokes are not part of the replacement.
        let dropped_strokes = self.session.reset_drawing();
        info!(
            user_id = %user_id,
            canvas_id = %self.canvas_id,
            sequence,
            dropped_strokes,
            "canvas state replaced"
        );

        let saved = self.current_canvas();
        self.router.broadcast(ServerMessage::CanvasState(saved), Some(connection));
        Ok(())
    }

    fn webrtc_signal(
        &mut self,
        connection: ConnectionId,
        target_user_id: &str,
        signal: serde_json::Value,
    ) -> Result<(), Rejection> {
        let user_id = self.require_member(connection)?;
        validate_signal_payload(&signal)?;
        self.router.relay_signal(&user_id, target_user_id, signal);
        Ok(())
    }

    fn apply_commands(&self, commands: Vec<CanvasCommand>) {
        for command in commands {
            if let Err(error) = self.store.apply(&self.canvas_id, command) {
                warn!(canvas_id = %self.canvas_id, error = %error, "canvas update not applied");
            }
        }
    }

    fn current_canvas(&self) -> CanvasSnapshot {
        self.store
            .snapshot(&self.canvas_id)
            .unwrap_or_else(|| CanvasSnapshot::empty(self.canvas_id.clone()))
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    fn on_disconnect(&mut self, connection: ConnectionId) {
        self.clients.remove(&connection);
        self.router.unregister(connection);
        let user_id = self
            .session
            .user_for_connection(connection)
            .map(|identity| identity.user_id.clone());
        if let Some(user_id) = user_id {
            if let Ok(departure) = self.session.leave(&user_id) {
                self.depart(departure);
            }
        }
    }

    fn on_evict(&mut self, user_id: &str, join_epoch: u64) {
        let current = self.session.identity(user_id).map(|identity| identity.join_epoch);
        if current != Some(join_epoch) {
            debug!(user_id, join_epoch, "ignoring stale eviction");
            return;
        }
        let Ok(departure) = self.session.leave(user_id) else { return };
        info!(user_id, "evicting idle member under memory pressure");
        let connection = departure.connection;
        self.depart(departure);
        self.router.close(connection, CLOSE_TRY_AGAIN_LATER, "evicted under memory pressure");
        self.clients.remove(&connection);
    }

    /// Idle members drop back to observers; their sockets stay open.
    fn sweep(&mut self, now: Instant) {
        let departures = self.session.expire_idle(now);
        if !departures.is_empty() {
            info!(expired = departures.len(), "expired idle members");
        }
        for departure in departures {
            self.depart(departure);
        }
        let purged = self.limiter.purge_stale();
        if purged > 0 {
            debug!(purged, "purged idle rate buckets");
        }
    }

    fn shutdown(&mut self) {
        let users = self.session.roster().into_iter().map(|user| user.user_id).collect::<Vec<_>>();
        for user_id in users {
            if let Ok(departure) = self.session.leave(&user_id) {
                self.apply_commands(departure.commands);
            }
        }
        let closed = self.router.close_all(CLOSE_GOING_AWAY, "server shutting down");
        self.clients.clear();
        info!(closed, "hub closed all connections");
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
