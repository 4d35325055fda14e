//! Cross-component scenario tests. These drive the coordinator, store,
//! premove queue, fabric, and watcher together against an in-memory
//! database, with plain mpsc receivers standing in for websockets.

mod scenarios;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::clock;
use crate::coordinator::Coordinator;
use crate::db::game::GameStore;
use crate::db::Pool;
use crate::events::{
    GameRef, JoinGamePayload, MakeMovePayload, ServerEvent, SetPremovePayload,
};
use crate::fabric::{SessionFabric, SocketId};
use crate::game::{Game, TimeControl, UserId};
use crate::premove::PremoveQueue;
use crate::rules::MoveInput;
use crate::stats::CountingStats;

pub struct Harness {
    pub store: Arc<GameStore>,
    pub fabric: Arc<SessionFabric>,
    pub premoves: Arc<PremoveQueue>,
    pub coordinator: Arc<Coordinator>,
    pub stats: Arc<CountingStats>,
}

impl Harness {
    pub async fn new() -> Harness {
        let pool = Pool::in_memory().await.unwrap();
        sqlx::migrate!().run(&pool.0).await.unwrap();

        let store = Arc::new(GameStore::new(pool));
        let fabric = Arc::new(SessionFabric::new());
        let premoves = Arc::new(PremoveQueue::new());
        let stats = Arc::new(CountingStats::default());
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            premoves.clone(),
            fabric.clone(),
            stats.clone(),
        ));
        Harness {
            store,
            fabric,
            premoves,
            coordinator,
            stats,
        }
    }

    /// Creates a 5+0 game between alice (white) and bob (black).
    pub async fn create_game(&self, id: &str) -> Game {
        let game = Game::new(
            id.to_owned(),
            alice(),
            bob(),
            TimeControl {
                base_minutes: 5,
                increment_seconds: 0,
                label: "5+0".to_owned(),
            },
            clock::now_ms(),
        );
        self.store.create(&game).await.unwrap();
        game
    }

    pub fn connect(&self, user: &UserId) -> (SocketId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let id = self.fabric.register(user.clone(), tx);
        (id, rx)
    }

    pub async fn join(&self, socket: SocketId, user: &UserId, game_id: &str) {
        self.coordinator
            .join_game(
                socket,
                user,
                JoinGamePayload {
                    game_id: game_id.to_owned(),
                    trace_id: None,
                },
            )
            .await
            .unwrap();
    }

    pub async fn play(&self, socket: SocketId, user: &UserId, game_id: &str, from: &str, to: &str) {
        self.coordinator
            .make_move(socket, user, move_payload(game_id, from, to))
            .await
            .unwrap();
    }

    /// Waits until every durable write queued so far has landed.
    pub async fn flush_persistence(&self) {
        self.store.flush().await.unwrap();
    }

    /// Reads the durable row, bypassing the cache.
    pub async fn load_durable(&self, game_id: &str) -> Game {
        self.store.evict(game_id);
        self.store.load(game_id).await.unwrap().unwrap()
    }
}

pub fn alice() -> UserId {
    UserId("alice".to_owned())
}

pub fn bob() -> UserId {
    UserId("bob".to_owned())
}

pub fn game_ref(game_id: &str) -> GameRef {
    GameRef {
        game_id: game_id.to_owned(),
    }
}

pub fn mv(from: &str, to: &str) -> MoveInput {
    MoveInput {
        from: from.to_owned(),
        to: to.to_owned(),
        promotion: None,
    }
}

pub fn move_payload(game_id: &str, from: &str, to: &str) -> MakeMovePayload {
    MakeMovePayload {
        game_id: game_id.to_owned(),
        mv: mv(from, to),
        client_timestamp: None,
        trace_id: None,
    }
}

pub fn premove_payload(game_id: &str, from: &str, to: &str) -> SetPremovePayload {
    SetPremovePayload {
        game_id: game_id.to_owned(),
        premove: mv(from, to),
        trace_id: None,
    }
}

pub fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn names(events: &[ServerEvent]) -> Vec<&'static str> {
    events.iter().map(ServerEvent::name).collect()
}

pub fn count_game_over(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ServerEvent::GameOver { .. }))
        .count()
}
