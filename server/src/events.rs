//! The wire vocabulary: named events with JSON payloads in both directions.
//! Client payloads are schema-validated here at the edge; anything that does
//! not decode is dropped with an `error` reply and never reaches the
//! coordinator. Request-reply events are acknowledged with their natural
//! response event (`join_game` → `game_state`, `set_premove` →
//! `premove_set`, …).

use serde::{Deserialize, Serialize};

use crate::clock::{self, ClockSnapshot};
use crate::game::{
    Game, GameId, GameResult, GameStatus, PlayerColor, ResultReason, TimeControl, UserId,
};
use crate::premove::{ClearReason, QueuedPremove};
use crate::rules::MoveInput;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRef {
    pub game_id: GameId,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGamePayload {
    pub game_id: GameId,
    #[serde(default)]
    pub trace_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MakeMovePayload {
    pub game_id: GameId,
    #[serde(rename = "move")]
    pub mv: MoveInput,
    #[serde(default)]
    pub client_timestamp: Option<i64>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPremovePayload {
    pub game_id: GameId,
    pub premove: MoveInput,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Message that may be sent by the client to the server.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinGame(JoinGamePayload),
    MakeMove(MakeMovePayload),
    SetPremove(SetPremovePayload),
    CancelPremove(GameRef),
    ResignGame(GameRef),
    OfferDraw(GameRef),
    AcceptDraw(GameRef),
    RejectDraw(GameRef),
    CancelGame(GameRef),
    OfferRematch(GameRef),
    AcceptRematch(GameRef),
    RejectRematch(GameRef),
    LeaveGame(GameRef),
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<ClientEvent, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Complete description of a game as one client is allowed to see it.
/// Sent on `join_game` so a reconnecting tab can render without further
/// round trips. Only the viewer's own premove slot is included.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatePayload {
    pub game_id: GameId,
    pub white_player: UserId,
    pub black_player: UserId,
    pub history: Vec<String>,
    pub status: GameStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GameResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_reason: Option<ResultReason>,
    pub clock: ClockSnapshot,
    pub white_ms: i64,
    pub black_ms: i64,
    pub time_control: TimeControl,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub your_color: Option<PlayerColor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub your_premove: Option<QueuedPremove>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_draw_offer_from: Option<PlayerColor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_player: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_deadline_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rematch_offer_from: Option<PlayerColor>,
    pub rematch_declined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_game_id: Option<GameId>,
}

impl GameStatePayload {
    pub fn for_viewer(game: &Game, viewer: Option<&UserId>, now_ms: i64) -> GameStatePayload {
        let projection = clock::project(&game.clock, now_ms);
        let your_color = viewer.and_then(|user| game.color_of(user));
        GameStatePayload {
            game_id: game.id.clone(),
            white_player: game.white_player.clone(),
            black_player: game.black_player.clone(),
            history: game.history.clone(),
            status: game.status,
            result: game.result,
            result_reason: game.result_reason,
            clock: game.clock.clone(),
            white_ms: projection.white_ms,
            black_ms: projection.black_ms,
            time_control: game.time_control.clone(),
            your_color,
            your_premove: your_color.and_then(|color| game.premove(color).clone()),
            pending_draw_offer_from: game.pending_draw_offer_from,
            disconnected_player: game.disconnected_player.clone(),
            disconnect_deadline_ms: game.disconnect_deadline_ms,
            rematch_offer_from: game.rematch_offer_from,
            rematch_declined: game.rematch_declined,
            next_game_id: game.next_game_id.clone(),
        }
    }
}

/// Everything the server can push to a client.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    GameState(GameStatePayload),
    #[serde(rename_all = "camelCase")]
    MoveMade {
        game_id: GameId,
        by: PlayerColor,
        #[serde(rename = "move")]
        mv: String,
        move_no: usize,
    },
    #[serde(rename_all = "camelCase")]
    ClockUpdate {
        game_id: GameId,
        white_ms: i64,
        black_ms: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        active_color: Option<PlayerColor>,
    },
    #[serde(rename_all = "camelCase")]
    PremoveSet {
        game_id: GameId,
        by: PlayerColor,
        premove: QueuedPremove,
    },
    #[serde(rename_all = "camelCase")]
    PremoveRejected {
        game_id: GameId,
        by: PlayerColor,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    PremoveCleared {
        game_id: GameId,
        by: PlayerColor,
        reason: ClearReason,
    },
    #[serde(rename_all = "camelCase")]
    GameOver {
        game_id: GameId,
        result: GameResult,
        reason: ResultReason,
    },
    #[serde(rename_all = "camelCase")]
    DrawOffered { game_id: GameId, by: PlayerColor },
    #[serde(rename_all = "camelCase")]
    DrawRejected { game_id: GameId, by: PlayerColor },
    #[serde(rename_all = "camelCase")]
    OpponentDisconnected {
        game_id: GameId,
        user_id: UserId,
        reconnect_deadline_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    OpponentReconnected { game_id: GameId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    OpponentJoined { game_id: GameId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    RematchOffered { game_id: GameId, by: PlayerColor },
    #[serde(rename_all = "camelCase")]
    RematchAccepted {
        game_id: GameId,
        new_game_id: GameId,
    },
    #[serde(rename_all = "camelCase")]
    RematchRejected { game_id: GameId },
    #[serde(rename_all = "camelCase")]
    OnlineCount { count: usize },
    Error { message: String },
}

impl ServerEvent {
    /// Event name tag, mostly for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::GameState(_) => "game_state",
            ServerEvent::MoveMade { .. } => "move_made",
            ServerEvent::ClockUpdate { .. } => "clock_update",
            ServerEvent::PremoveSet { .. } => "premove_set",
            ServerEvent::PremoveRejected { .. } => "premove_rejected",
            ServerEvent::PremoveCleared { .. } => "premove_cleared",
            ServerEvent::GameOver { .. } => "game_over",
            ServerEvent::DrawOffered { .. } => "draw_offered",
            ServerEvent::DrawRejected { .. } => "draw_rejected",
            ServerEvent::OpponentDisconnected { .. } => "opponent_disconnected",
            ServerEvent::OpponentReconnected { .. } => "opponent_reconnected",
            ServerEvent::OpponentJoined { .. } => "opponent_joined",
            ServerEvent::RematchOffered { .. } => "rematch_offered",
            ServerEvent::RematchAccepted { .. } => "rematch_accepted",
            ServerEvent::RematchRejected { .. } => "rematch_rejected",
            ServerEvent::OnlineCount { .. } => "online_count",
            ServerEvent::Error { .. } => "error",
        }
    }
}
