//! The game record and its closed vocabulary. Everything the store persists
//! and the coordinator mutates lives here; the chess rules themselves are
//! behind `crate::rules`.

use serde::{Deserialize, Serialize};

use crate::clock::ClockSnapshot;
use crate::premove::QueuedPremove;

pub type GameId = String;

/// Stable user identifier, handed to us by the identity provider. Opaque.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlayerColor {
    #[serde(rename = "w")]
    White,
    #[serde(rename = "b")]
    Black,
}

impl PlayerColor {
    pub fn other(self) -> PlayerColor {
        match self {
            PlayerColor::White => PlayerColor::Black,
            PlayerColor::Black => PlayerColor::White,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlayerColor::White => "w",
            PlayerColor::Black => "b",
        }
    }

    pub fn parse(s: &str) -> Option<PlayerColor> {
        match s {
            "w" => Some(PlayerColor::White),
            "b" => Some(PlayerColor::Black),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Ongoing,
    Completed,
}

impl GameStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Ongoing => "ongoing",
            GameStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<GameStatus> {
        match s {
            "ongoing" => Some(GameStatus::Ongoing),
            "completed" => Some(GameStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameResult {
    White,
    Black,
    Draw,
    Aborted,
}

impl GameResult {
    /// The result that declares `color` the winner.
    pub fn win_for(color: PlayerColor) -> GameResult {
        match color {
            PlayerColor::White => GameResult::White,
            PlayerColor::Black => GameResult::Black,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameResult::White => "white",
            GameResult::Black => "black",
            GameResult::Draw => "draw",
            GameResult::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<GameResult> {
        match s {
            "white" => Some(GameResult::White),
            "black" => Some(GameResult::Black),
            "draw" => Some(GameResult::Draw),
            "aborted" => Some(GameResult::Aborted),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultReason {
    Checkmate,
    Stalemate,
    Draw,
    Timeout,
    Resignation,
    DisconnectTimeout,
    DrawAgreed,
    CancelledDueToFirstMoveTimeout,
}

impl ResultReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultReason::Checkmate => "checkmate",
            ResultReason::Stalemate => "stalemate",
            ResultReason::Draw => "draw",
            ResultReason::Timeout => "timeout",
            ResultReason::Resignation => "resignation",
            ResultReason::DisconnectTimeout => "disconnect_timeout",
            ResultReason::DrawAgreed => "draw_agreed",
            ResultReason::CancelledDueToFirstMoveTimeout => "cancelled_due_to_first_move_timeout",
        }
    }

    pub fn parse(s: &str) -> Option<ResultReason> {
        match s {
            "checkmate" => Some(ResultReason::Checkmate),
            "stalemate" => Some(ResultReason::Stalemate),
            "draw" => Some(ResultReason::Draw),
            "timeout" => Some(ResultReason::Timeout),
            "resignation" => Some(ResultReason::Resignation),
            "disconnect_timeout" => Some(ResultReason::DisconnectTimeout),
            "draw_agreed" => Some(ResultReason::DrawAgreed),
            "cancelled_due_to_first_move_timeout" => {
                Some(ResultReason::CancelledDueToFirstMoveTimeout)
            }
            _ => None,
        }
    }
}

/// Time control as chosen at game creation. `label` is a display tag the
/// matchmaker passes through ("5+3 blitz"), never interpreted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeControl {
    pub base_minutes: i64,
    pub increment_seconds: i64,
    #[serde(default)]
    pub label: String,
}

impl TimeControl {
    pub fn base_ms(&self) -> i64 {
        self.base_minutes * 60 * 1000
    }

    pub fn increment_ms(&self) -> i64 {
        self.increment_seconds * 1000
    }

    /// Guards against nonsense and overflow-sized budgets before a clock is
    /// primed from this control.
    pub fn is_legal(&self) -> bool {
        (1..=600).contains(&self.base_minutes) && (0..=180).contains(&self.increment_seconds)
    }
}

/// Per-player draw offers are capped for the whole game.
pub const MAX_DRAW_OFFERS: u8 = 2;

/// The authoritative game record. One row in the store, one value in the
/// in-process cache while the game is ongoing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: GameId,
    pub white_player: UserId,
    pub black_player: UserId,
    /// UCI half-moves from the start position. Always a legal play sequence.
    pub history: Vec<String>,
    pub status: GameStatus,
    pub result: Option<GameResult>,
    pub result_reason: Option<ResultReason>,
    pub clock: ClockSnapshot,
    pub time_control: TimeControl,
    pub premove_white: Option<QueuedPremove>,
    pub premove_black: Option<QueuedPremove>,
    pub disconnected_player: Option<UserId>,
    pub disconnect_deadline_ms: Option<i64>,
    pub stats_applied: bool,
    pub pending_draw_offer_from: Option<PlayerColor>,
    pub white_draw_offers: u8,
    pub black_draw_offers: u8,
    pub rematch_offer_from: Option<PlayerColor>,
    pub rematch_declined: bool,
    pub next_game_id: Option<GameId>,
    pub created_at_ms: i64,
}

impl Game {
    /// A freshly created game: clocks primed to the base budget, nobody on
    /// the move yet, and a first-move deadline armed.
    pub fn new(
        id: GameId,
        white_player: UserId,
        black_player: UserId,
        time_control: TimeControl,
        now_ms: i64,
    ) -> Game {
        Game {
            id,
            white_player,
            black_player,
            history: Vec::new(),
            status: GameStatus::Ongoing,
            result: None,
            result_reason: None,
            clock: ClockSnapshot::initial(&time_control, now_ms),
            time_control,
            premove_white: None,
            premove_black: None,
            disconnected_player: None,
            disconnect_deadline_ms: None,
            stats_applied: false,
            pending_draw_offer_from: None,
            white_draw_offers: 0,
            black_draw_offers: 0,
            rematch_offer_from: None,
            rematch_declined: false,
            next_game_id: None,
            created_at_ms: now_ms,
        }
    }

    pub fn is_ongoing(&self) -> bool {
        self.status == GameStatus::Ongoing
    }

    pub fn color_of(&self, user: &UserId) -> Option<PlayerColor> {
        if &self.white_player == user {
            Some(PlayerColor::White)
        } else if &self.black_player == user {
            Some(PlayerColor::Black)
        } else {
            None
        }
    }

    pub fn player(&self, color: PlayerColor) -> &UserId {
        match color {
            PlayerColor::White => &self.white_player,
            PlayerColor::Black => &self.black_player,
        }
    }

    pub fn premove(&self, color: PlayerColor) -> &Option<QueuedPremove> {
        match color {
            PlayerColor::White => &self.premove_white,
            PlayerColor::Black => &self.premove_black,
        }
    }

    pub fn premove_mut(&mut self, color: PlayerColor) -> &mut Option<QueuedPremove> {
        match color {
            PlayerColor::White => &mut self.premove_white,
            PlayerColor::Black => &mut self.premove_black,
        }
    }

    pub fn draw_offers(&self, color: PlayerColor) -> u8 {
        match color {
            PlayerColor::White => self.white_draw_offers,
            PlayerColor::Black => self.black_draw_offers,
        }
    }

    pub fn draw_offers_mut(&mut self, color: PlayerColor) -> &mut u8 {
        match color {
            PlayerColor::White => &mut self.white_draw_offers,
            PlayerColor::Black => &mut self.black_draw_offers,
        }
    }

    /// Checks the record-level invariants that must hold after every
    /// committed transition. Only wired up in debug builds.
    pub fn debug_check_invariants(&self) {
        if cfg!(debug_assertions) {
            if self.status == GameStatus::Completed {
                debug_assert!(self.result.is_some(), "completed game without result");
                debug_assert!(
                    self.clock.active_color.is_none(),
                    "completed game with a running clock"
                );
                debug_assert!(
                    self.premove_white.is_none() && self.premove_black.is_none(),
                    "completed game with queued premoves"
                );
            }
            debug_assert_eq!(
                self.disconnected_player.is_some(),
                self.disconnect_deadline_ms.is_some(),
                "disconnect marker and deadline must be set together"
            );
            if self.stats_applied {
                debug_assert!(
                    self.status == GameStatus::Completed && self.result != Some(GameResult::Aborted),
                    "stats applied outside a counted completion"
                );
            }
        }
    }
}
