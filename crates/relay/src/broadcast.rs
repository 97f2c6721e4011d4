// Fan-out of server frames to connections.
//
// Every socket registers an unbounded outbound channel. A connection is an
// observer until it is bound to a session member, and may additionally be
// a peer-mesh participant. Members are delivered to in join order, then
// observers in connect order.

use canvasync_common::protocol::ws::ServerMessage;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = u64;

/// WebSocket close code for "try again later".
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// WebSocket close code for server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Policy close used when a newer connection takes over an identity.
pub const CLOSE_REPLACED: u16 = 4000;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug)]
struct Connection {
    sender: OutboundSender,
    /// Opaque id exposed to mesh peers.
    client_id: String,
    user_id: Option<String>,
    mesh_room: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnection {
    pub user_id: Option<String>,
    pub client_id: String,
    pub was_peer: bool,
}

/// Observers only see canvas traffic.
pub fn observer_may_receive(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::DrawingData { .. } | ServerMessage::CanvasState(_))
}

#[derive(Debug, Default)]
pub struct BroadcastRouter {
    connections: IndexMap<ConnectionId, Connection>,
    members: IndexMap<String, ConnectionId>,
    peers: IndexMap<String, ConnectionId>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connection: ConnectionId, sender: OutboundSender) -> String {
        let client_id = Uuid::new_v4().to_string();
        self.connections.insert(
            connection,
            Connection { sender, client_id: client_id.clone(), user_id: None, mesh_room: None },
        );
        client_id
    }

    /// Forget a connection. Mesh peers are told it left.
    pub fn unregister(&mut self, connection: ConnectionId) -> Option<ClosedConnection> {
        let removed = self.connections.shift_remove(&connection)?;
        if let Some(user_id) = &removed.user_id {
            if self.members.get(user_id) == Some(&connection) {
                self.members.shift_remove(user_id);
            }
        }
        let was_peer = self.peers.shift_remove(&removed.client_id).is_some();
        if was_peer {
            self.broadcast_peers(
                ServerMessage::PeerLeave { client_id: removed.client_id.clone() },
                None,
            );
        }
        Some(ClosedConnection { user_id: removed.user_id, client_id: removed.client_id, was_peer })
    }

    pub fn is_registered(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    // ── Members ────────────────────────────────────────────────────

    /// Promote `connection` to the member slot of `user_id`. Returns the
    /// connection previously bound to that user, now demoted to observer.
    pub fn bind_member(&mut self, user_id: &str, connection: ConnectionId) -> Option<ConnectionId> {
        if let Some(entry) = self.connections.get_mut(&connection) {
            entry.user_id = Some(user_id.to_string());
        }
        let previous = self.members.insert(user_id.to_string(), connection);
        let previous = previous.filter(|previous| *previous != connection)?;
        if let Some(entry) = self.connections.get_mut(&previous) {
            entry.user_id = None;
        }
        Some(previous)
    }

    /// Demote the member's connection back to observer.
    pub fn unbind_member(&mut self, user_id: &str) -> Option<ConnectionId> {
        let connection = self.members.shift_remove(user_id)?;
        if let Some(entry) = self.connections.get_mut(&connection) {
            entry.user_id = None;
        }
        Some(connection)
    }

    pub fn member_of(&self, connection: ConnectionId) -> Option<&str> {
        self.connections.get(&connection).and_then(|entry| entry.user_id.as_deref())
    }

    /// Queue the joiner's own frames before anyone else hears about it.
    pub fn announce_join(
        &mut self,
        connection: ConnectionId,
        user_id: &str,
        own_frames: Vec<ServerMessage>,
        announcement: Option<ServerMessage>,
    ) {
        for frame in own_frames {
            self.send_to(connection, frame);
        }
        if let Some(announcement) = announcement {
            self.broadcast_members(announcement, Some(user_id));
        }
    }

    // ── Delivery ───────────────────────────────────────────────────

    pub fn send_to(&mut self, connection: ConnectionId, message: ServerMessage) -> bool {
        let delivered = self
            .connections
            .get(&connection)
            .is_some_and(|entry| entry.sender.send(Outbound::Message(message)).is_ok());
        if !delivered {
            self.prune(&[connection]);
        }
        delivered
    }

    pub fn send_to_user(&mut self, user_id: &str, message: ServerMessage) -> bool {
        match self.members.get(user_id).copied() {
            Some(connection) => self.send_to(connection, message),
            None => false,
        }
    }

    /// Deliver to every member except `exclude`.
    pub fn broadcast_members(&mut self, message: ServerMessage, exclude: Option<&str>) -> usize {
        let targets = self
            .members
            .iter()
            .filter(|(user_id, _)| Some(user_id.as_str()) != exclude)
            .map(|(_, connection)| *connection)
            .collect::<Vec<_>>();
        self.deliver(&targets, &message)
    }

    /// Deliver to members and, when allowed, to observers.
    pub fn broadcast(&mut self, message: ServerMessage, exclude: Option<ConnectionId>) -> usize {
        let mut targets = self
            .members
            .values()
            .copied()
            .filter(|connection| Some(*connection) != exclude)
            .collect::<Vec<_>>();
        if observer_may_receive(&message) {
            targets.extend(
                self.observer_ids().into_iter().filter(|connection| Some(*connection) != exclude),
            );
        }
        self.deliver(&targets, &message)
    }

    /// Forward an opaque negotiation payload to one member. Unknown or
    /// vanished targets are dropped quietly.
    pub fn relay_signal(&mut self, from_user_id: &str, target_user_id: &str, signal: serde_json::Value) -> bool {
        let message = ServerMessage::WebrtcSignal {
            from_user_id: from_user_id.to_string(),
            target_user_id: target_user_id.to_string(),
            signal,
        };
        let delivered = self.send_to_user(target_user_id, message);
        if !delivered {
            debug!(from_user_id, target_user_id, "signal target not connected, dropping");
        }
        delivered
    }

    fn deliver(&mut self, targets: &[ConnectionId], message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for connection in targets {
            match self.connections.get(connection) {
                Some(entry) if entry.sender.send(Outbound::Message(message.clone())).is_ok() => {
                    delivered += 1;
                }
                _ => dead.push(*connection),
            }
        }
        self.prune(&dead);
        delivered
    }

    fn prune(&mut self, dead: &[ConnectionId]) {
        for connection in dead {
            if let Some(entry) = self.connections.get(connection) {
                if entry.sender.is_closed() {
                    debug!(connection, "pruning closed outbound channel");
                    self.unregister(*connection);
                }
            }
        }
    }

    // ── Peer mesh ──────────────────────────────────────────────────

    /// Add `connection` to the mesh and return the `joined` reply. Other
    /// peers receive `peer-join`.
    pub fn join_mesh(&mut self, connection: ConnectionId, room_id: Option<String>) -> Option<ServerMessage> {
        let room_id = room_id.unwrap_or_else(|| "default".to_string());
        let entry = self.connections.get_mut(&connection)?;
        entry.mesh_room = Some(room_id.clone());
        let client_id = entry.client_id.clone();

        let peers = self.peers.keys().filter(|peer| **peer != client_id).cloned().collect();
        if self.peers.insert(client_id.clone(), connection).is_none() {
            self.broadcast_peers(ServerMessage::PeerJoin { client_id: client_id.clone() }, Some(connection));
        }
        Some(ServerMessage::Joined { room_id, client_id, peers })
    }

    /// Relay a mesh signal to one peer, or to every other peer when no
    /// target is named.
    pub fn mesh_signal(
        &mut self,
        from: ConnectionId,
        target_id: Option<String>,
        data: serde_json::Value,
    ) -> usize {
        let Some(from_id) = self.mesh_client_id(from) else { return 0 };
        let message = ServerMessage::Signal { from_id, target_id: target_id.clone(), data };
        match target_id {
            Some(target) => match self.peers.get(&target).copied() {
                Some(connection) => usize::from(self.send_to(connection, message)),
                None => {
                    debug!(target = %target, "mesh signal target not connected, dropping");
                    0
                }
            },
            None => self.broadcast_peers(message, Some(from)),
        }
    }

    pub fn mesh_draw(&mut self, from: ConnectionId, data: serde_json::Value) -> usize {
        let Some(from_id) = self.mesh_client_id(from) else { return 0 };
        self.broadcast_peers(ServerMessage::Draw { from_id, data }, Some(from))
    }

    fn mesh_client_id(&self, connection: ConnectionId) -> Option<String> {
        let entry = self.connections.get(&connection)?;
        self.peers.contains_key(&entry.client_id).then(|| entry.client_id.clone())
    }

    fn broadcast_peers(&mut self, message: ServerMessage, exclude: Option<ConnectionId>) -> usize {
        let targets = self
            .peers
            .values()
            .copied()
            .filter(|connection| Some(*connection) != exclude)
            .collect::<Vec<_>>();
        self.deliver(&targets, &message)
    }

    // ── Shedding & shutdown ────────────────────────────────────────

    fn observer_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, entry)| entry.user_id.is_none())
            .map(|(connection, _)| *connection)
            .collect()
    }

    pub fn close(&mut self, connection: ConnectionId, code: u16, reason: &str) -> bool {
        let Some(entry) = self.connections.get(&connection) else { return false };
        let _ = entry.sender.send(Outbound::Close { code, reason: reason.to_string() });
        self.unregister(connection).is_some()
    }

    /// Disconnect up to `limit` of the oldest observers.
    pub fn shed_observers(&mut self, limit: usize) -> Vec<ConnectionId> {
        let victims = self.observer_ids().into_iter().take(limit).collect::<Vec<_>>();
        for connection in &victims {
            self.close(*connection, CLOSE_TRY_AGAIN_LATER, "server under memory pressure");
        }
        victims
    }

    pub fn close_all(&mut self, code: u16, reason: &str) -> usize {
        let all = self.connections.keys().copied().collect::<Vec<_>>();
        for connection in &all {
            if let Some(entry) = self.connections.get(connection) {
                let _ = entry.sender.send(Outbound::Close { code, reason: reason.to_string() });
            }
        }
        self.connections.clear();
        self.members.clear();
        self.peers.clear();
        all.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn observer_count(&self) -> usize {
        self.connections.len() - self.members.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use canvasync_common::protocol::ws::{DrawKind, DrawingData};
    use canvasync_common::types::CanvasSnapshot;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn connect(router: &mut BroadcastRouter, connection: ConnectionId) -> UnboundedReceiver<Outbound> {
        let (sender, receiver) = mpsc::unbounded_channel();
        router.register(connection, sender);
        receiver
    }

    fn drain(receiver: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn kinds(receiver: &mut UnboundedReceiver<Outbound>) -> Vec<&'static str> {
        drain(receiver)
            .into_iter()
            .map(|frame| match frame {
                Outbound::Message(message) => message.kind(),
                Outbound::Close { .. } => "close",
            })
            .collect()
    }

    fn drawing() -> ServerMessage {
        ServerMessage::DrawingData {
            user_id: "u1".into(),
            sequence: 1,
            data: DrawingData::new(DrawKind::Draw).at(0.5, 0.5),
        }
    }

    fn chat() -> ServerMessage {
        ServerMessage::UserLeft { user_id: "u9".into(), nickname: "x".into(), user_count: 1 }
    }

    #[test]
    fn members_receive_in_join_order_and_originator_is_excluded() {
        let mut router = BroadcastRouter::new();
        let mut rx = [connect(&mut router, 1), connect(&mut router, 2), connect(&mut router, 3)];
        router.bind_member("c", 3);
        router.bind_member("a", 1);
        router.bind_member("b", 2);

        assert_eq!(router.broadcast_members(chat(), Some("a")), 2);
        assert!(drain(&mut rx[0]).is_empty());
        assert_eq!(kinds(&mut rx[1]), vec!["user-left"]);
        assert_eq!(kinds(&mut rx[2]), vec!["user-left"]);

        assert_eq!(router.members.keys().cloned().collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }

    #[test]
    fn observers_only_receive_canvas_traffic() {
        let mut router = BroadcastRouter::new();
        let mut member = connect(&mut router, 1);
        let mut observer = connect(&mut router, 2);
        router.bind_member("u1", 1);

        router.broadcast(chat(), None);
        router.broadcast(drawing(), None);
        router.broadcast(ServerMessage::CanvasState(CanvasSnapshot::empty("main")), None);

        assert_eq!(kinds(&mut member), vec!["user-left", "drawing-data", "canvas-state"]);
        assert_eq!(kinds(&mut observer), vec!["drawing-data", "canvas-state"]);
        assert_eq!(router.observer_count(), 1);
    }

    #[test]
    fn join_frames_precede_announcement() {
        let mut router = BroadcastRouter::new();
        let mut first = connect(&mut router, 1);
        let mut second = connect(&mut router, 2);
        router.bind_member("u1", 1);
        router.bind_member("u2", 2);

        router.announce_join(
            2,
            "u2",
            vec![
                ServerMessage::SessionJoined {
                    user_id: "u2".into(),
                    users: vec![],
                    user_count: 2,
                    messages: vec![],
                    reconnected: false,
                },
                ServerMessage::CanvasState(CanvasSnapshot::empty("main")),
            ],
            Some(ServerMessage::UserJoined { user_id: "u2".into(), nickname: "G".into(), user_count: 2 }),
        );

        assert_eq!(kinds(&mut second), vec!["session-joined", "canvas-state"]);
        assert_eq!(kinds(&mut first), vec!["user-joined"]);
    }

    #[test]
    fn rebinding_demotes_previous_connection() {
        let mut router = BroadcastRouter::new();
        let _old = connect(&mut router, 1);
        let _new = connect(&mut router, 2);
        assert_eq!(router.bind_member("u1", 1), None);
        assert_eq!(router.bind_member("u1", 2), Some(1));
        assert_eq!(router.member_of(1), None);
        assert_eq!(router.member_of(2), Some("u1"));

        assert_eq!(router.unbind_member("u1"), Some(2));
        assert_eq!(router.observer_count(), 2);
    }

    #[test]
    fn signal_to_absent_target_is_dropped() {
        let mut router = BroadcastRouter::new();
        let mut target = connect(&mut router, 1);
        router.bind_member("u2", 1);

        let payload = json!({ "type": "offer", "sdp": "v=0" });
        assert!(router.relay_signal("u1", "u2", payload.clone()));
        assert!(!router.relay_signal("u1", "nobody", payload.clone()));

        match drain(&mut target).pop() {
            Some(Outbound::Message(ServerMessage::WebrtcSignal { from_user_id, signal, .. })) => {
                assert_eq!(from_user_id, "u1");
                assert_eq!(signal, payload);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn closed_channels_are_pruned_on_fanout() {
        let mut router = BroadcastRouter::new();
        let mut alive = connect(&mut router, 1);
        let gone = connect(&mut router, 2);
        router.bind_member("u1", 1);
        router.bind_member("u2", 2);
        drop(gone);

        assert_eq!(router.broadcast(drawing(), None), 1);
        assert_eq!(router.connection_count(), 1);
        assert_eq!(router.member_count(), 1);
        assert_eq!(kinds(&mut alive), vec!["drawing-data"]);
    }

    #[test]
    fn mesh_join_signal_and_leave() {
        let mut router = BroadcastRouter::new();
        let mut a = connect(&mut router, 1);
        let mut b = connect(&mut router, 2);

        let Some(ServerMessage::Joined { peers, client_id: a_id, .. }) = router.join_mesh(1, None) else {
            panic!("expected joined reply");
        };
        assert!(peers.is_empty());
        let Some(ServerMessage::Joined { peers, client_id: b_id, room_id }) =
            router.join_mesh(2, Some("lobby".into()))
        else {
            panic!("expected joined reply");
        };
        assert_eq!(peers, vec![a_id.clone()]);
        assert_eq!(room_id, "lobby");
        assert_eq!(kinds(&mut a), vec!["peer-join"]);

        assert_eq!(router.mesh_signal(2, Some(a_id.clone()), json!({ "candidate": 1 })), 1);
        assert_eq!(router.mesh_draw(1, json!([1, 2])), 1);
        assert_eq!(router.mesh_signal(2, Some("missing".into()), json!({})), 0);
        assert_eq!(kinds(&mut a), vec!["signal"]);
        assert_eq!(kinds(&mut b), vec!["draw"]);

        let closed = router.unregister(2).unwrap();
        assert!(closed.was_peer);
        assert_eq!(closed.client_id, b_id);
        assert_eq!(kinds(&mut a), vec!["peer-leave"]);
    }

    #[test]
    fn non_peers_cannot_use_the_mesh() {
        let mut router = BroadcastRouter::new();
        let _a = connect(&mut router, 1);
        assert_eq!(router.mesh_draw(1, json!({})), 0);
        assert_eq!(router.mesh_signal(1, None, json!({})), 0);
    }

    #[test]
    fn shedding_closes_oldest_observers_only() {
        let mut router = BroadcastRouter::new();
        let mut receivers = (1..=4).map(|id| connect(&mut router, id)).collect::<Vec<_>>();
        router.bind_member("u1", 1);

        assert_eq!(router.shed_observers(2), vec![2, 3]);
        assert_eq!(router.connection_count(), 2);
        assert!(matches!(drain(&mut receivers[1]).as_slice(), [Outbound::Close { code: CLOSE_TRY_AGAIN_LATER, .. }]));
        assert!(drain(&mut receivers[0]).is_empty());
        assert!(drain(&mut receivers[3]).is_empty());
    }

    #[test]
    fn close_all_notifies_everyone() {
        let mut router = BroadcastRouter::new();
        let mut a = connect(&mut router, 1);
        let mut b = connect(&mut router, 2);
        router.bind_member("u1", 1);

        assert_eq!(router.close_all(CLOSE_GOING_AWAY, "shutting down"), 2);
        assert_eq!(kinds(&mut a), vec!["close"]);
        assert_eq!(kinds(&mut b), vec!["close"]);
        assert_eq!(router.connection_count(), 0);
        assert_eq!(router.member_count(), 0);
    }
}
