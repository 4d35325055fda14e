//! The session fabric: which connections exist, who owns them, and which
//! rooms they are in. Every user has a user room (all of their tabs and
//! devices) and every active game has a game room.
//!
//! This implementation is single-node and in-process. `emit`/`count` is the
//! seam a pub/sub-backed broadcaster would replace for clustering; nothing
//! above this module would change.
//!
//! Emits never block and are never awaited: a slow client gets its events
//! dropped once its queue is full, and the drop is logged.

use std::collections::HashSet;
use std::sync::atomic::{self, AtomicUsize};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::mpsc;

use crate::events::ServerEvent;
use crate::game::{GameId, UserId};

/// Process-wide handle for one websocket connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(usize);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RoomId {
    Game(GameId),
    User(UserId),
}

struct SocketData {
    to_client: mpsc::Sender<ServerEvent>,
    user: UserId,
    /// Game rooms this socket has joined, for the disconnect sweep.
    game_rooms: HashSet<GameId>,
}

#[derive(Default)]
pub struct SessionFabric {
    sockets: DashMap<SocketId, SocketData>,
    rooms: DashMap<RoomId, HashSet<SocketId>>,
    next_id: AtomicUsize,
}

impl SessionFabric {
    pub fn new() -> SessionFabric {
        SessionFabric::default()
    }

    /// Registers a connection whose identity survived the handshake. The
    /// socket joins its user room immediately; game rooms follow on
    /// `join_game`.
    pub fn register(&self, user: UserId, to_client: mpsc::Sender<ServerEvent>) -> SocketId {
        let id = SocketId(self.next_id.fetch_add(1, atomic::Ordering::Relaxed) + 1);
        self.sockets.insert(
            id,
            SocketData {
                to_client,
                user: user.clone(),
                game_rooms: HashSet::new(),
            },
        );
        self.join_room(id, RoomId::User(user));
        self.broadcast_online_count();
        id
    }

    /// Removes a connection and takes it out of all of its rooms. Returns
    /// the identity and the game rooms it was in so the caller can run the
    /// disconnect sweep.
    pub fn unregister(&self, id: SocketId) -> Option<(UserId, Vec<GameId>)> {
        let (_, data) = self.sockets.remove(&id)?;
        self.leave_room(id, &RoomId::User(data.user.clone()));
        for game_id in &data.game_rooms {
            self.leave_room(id, &RoomId::Game(game_id.clone()));
        }
        info!(
            "removed socket of user {}; {} connections remain",
            data.user,
            self.sockets.len()
        );
        self.broadcast_online_count();
        Some((data.user, data.game_rooms.into_iter().collect()))
    }

    pub fn user_of(&self, id: SocketId) -> Option<UserId> {
        self.sockets.get(&id).map(|data| data.user.clone())
    }

    pub fn join_game_room(&self, id: SocketId, game_id: &str) {
        if let Some(mut data) = self.sockets.get_mut(&id) {
            data.game_rooms.insert(game_id.to_owned());
        }
        self.join_room(id, RoomId::Game(game_id.to_owned()));
    }

    pub fn leave_game_room(&self, id: SocketId, game_id: &str) {
        if let Some(mut data) = self.sockets.get_mut(&id) {
            data.game_rooms.remove(game_id);
        }
        self.leave_room(id, &RoomId::Game(game_id.to_owned()));
    }

    fn join_room(&self, id: SocketId, room: RoomId) {
        self.rooms.entry(room).or_default().insert(id);
    }

    fn leave_room(&self, id: SocketId, room: &RoomId) {
        // The entry API holds the shard lock across the emptiness check so
        // a concurrent join cannot land between removal and cleanup.
        if let Entry::Occupied(mut entry) = self.rooms.entry(room.clone()) {
            entry.get_mut().remove(&id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Fire-and-forget send to one socket.
    pub fn send_to(&self, id: SocketId, event: ServerEvent) {
        if let Some(data) = self.sockets.get(&id) {
            if let Err(error) = data.to_client.try_send(event) {
                warn!("dropping event for a socket of {}: {error}", data.user);
            }
        }
    }

    fn emit(&self, room: &RoomId, event: &ServerEvent) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        for id in members.iter() {
            self.send_to(*id, event.clone());
        }
    }

    pub fn emit_game(&self, game_id: &str, event: &ServerEvent) {
        self.emit(&RoomId::Game(game_id.to_owned()), event);
    }

    pub fn emit_user(&self, user: &UserId, event: &ServerEvent) {
        self.emit(&RoomId::User(user.clone()), event);
    }

    pub fn count(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
    }

    /// Does `user` have any live connection inside this game's room? The
    /// timeout watcher asks this before forfeiting a disconnected player.
    pub fn user_present_in_game(&self, game_id: &str, user: &UserId) -> bool {
        let Some(members) = self.rooms.get(&RoomId::Game(game_id.to_owned())) else {
            return false;
        };
        members.iter().any(|id| {
            self.sockets
                .get(id)
                .map(|data| &data.user == user)
                .unwrap_or(false)
        })
    }

    pub fn connection_count(&self) -> usize {
        self.sockets.len()
    }

    fn broadcast_online_count(&self) {
        let event = ServerEvent::OnlineCount {
            count: self.sockets.len(),
        };
        for entry in self.sockets.iter() {
            if let Err(error) = entry.to_client.try_send(event.clone()) {
                warn!("dropping online count for a socket: {error}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn user(name: &str) -> UserId {
        UserId(name.to_owned())
    }

    fn connect(fabric: &SessionFabric, name: &str) -> (SocketId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let id = fabric.register(user(name), tx);
        (id, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[test]
    fn user_rooms_reach_every_tab() {
        let fabric = SessionFabric::new();
        let (_, mut tab_a) = connect(&fabric, "alice");
        let (_, mut tab_b) = connect(&fabric, "alice");
        let (_, mut bob) = connect(&fabric, "bob");
        drain(&mut tab_a);
        drain(&mut tab_b);
        drain(&mut bob);

        fabric.emit_user(
            &user("alice"),
            &ServerEvent::Error {
                message: "ping".to_owned(),
            },
        );
        assert_eq!(drain(&mut tab_a), vec!["error"]);
        assert_eq!(drain(&mut tab_b), vec!["error"]);
        assert_eq!(drain(&mut bob), Vec::<&str>::new());
    }

    #[test]
    fn game_rooms_and_presence() {
        let fabric = SessionFabric::new();
        let (alice, mut alice_rx) = connect(&fabric, "alice");
        let (bob, _bob_rx) = connect(&fabric, "bob");

        fabric.join_game_room(alice, "g1");
        fabric.join_game_room(bob, "g1");
        assert_eq!(fabric.count(&RoomId::Game("g1".to_owned())), 2);
        assert!(fabric.user_present_in_game("g1", &user("alice")));

        drain(&mut alice_rx);
        fabric.emit_game(
            "g1",
            &ServerEvent::Error {
                message: "room ping".to_owned(),
            },
        );
        assert_eq!(drain(&mut alice_rx), vec!["error"]);

        fabric.leave_game_room(alice, "g1");
        assert!(!fabric.user_present_in_game("g1", &user("alice")));
        assert!(fabric.user_present_in_game("g1", &user("bob")));
    }

    #[test]
    fn unregister_reports_game_rooms_and_updates_counts() {
        let fabric = SessionFabric::new();
        let (alice, _rx) = connect(&fabric, "alice");
        fabric.join_game_room(alice, "g1");
        fabric.join_game_room(alice, "g2");

        let (who, mut rooms) = fabric.unregister(alice).unwrap();
        rooms.sort();
        assert_eq!(who, user("alice"));
        assert_eq!(rooms, vec!["g1".to_owned(), "g2".to_owned()]);
        assert_eq!(fabric.connection_count(), 0);
        assert_eq!(fabric.count(&RoomId::Game("g1".to_owned())), 0);

        // Unregistering twice is harmless.
        assert!(fabric.unregister(alice).is_none());
    }

    #[test]
    fn online_count_is_broadcast_on_change() {
        let fabric = SessionFabric::new();
        let (_alice, mut alice_rx) = connect(&fabric, "alice");
        let (bob, _bob_rx) = connect(&fabric, "bob");

        // Alice saw the count change when bob connected.
        let mut saw = 0;
        while let Ok(event) = alice_rx.try_recv() {
            if let ServerEvent::OnlineCount { count } = event {
                saw = count;
            }
        }
        assert_eq!(saw, 2);

        fabric.unregister(bob);
        let mut saw = 0;
        while let Ok(event) = alice_rx.try_recv() {
            if let ServerEvent::OnlineCount { count } = event {
                saw = count;
            }
        }
        assert_eq!(saw, 1);
    }
}
