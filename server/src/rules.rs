//! Narrow seam to the chess rules library. The coordinator never asks
//! shakmaty anything directly; everything it needs is one of the four
//! operations below, which keeps move generation out of the core and makes
//! the rules dependency swappable.

use shakmaty::{uci::Uci, CastlingMode, Chess, Outcome, Position, Role, Square};
use thiserror::Error;

/// The opaque position handle callers thread between operations.
pub type GamePosition = Chess;

use serde::{Deserialize, Serialize};

use crate::game::{GameResult, PlayerColor, ResultReason};

/// A move as the client states it: coordinates plus an optional promotion
/// piece. The same shape is used for normal moves and premoves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveInput {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<char>,
}

impl MoveInput {
    /// The UCI text for this input, e.g. `e2e4` or `e7e8q`.
    pub fn uci_text(&self) -> String {
        let mut text = format!(
            "{}{}",
            self.from.to_ascii_lowercase(),
            self.to.to_ascii_lowercase()
        );
        if let Some(promotion) = self.promotion {
            text.push(promotion.to_ascii_lowercase());
        }
        text
    }
}

/// The stored history no longer replays to a legal position. This is a
/// fatal inconsistency: the operation fails closed and the game is left
/// in place for inspection.
#[derive(Debug, Error)]
#[error("corrupt history at half-move {move_no}: {text}")]
pub struct CorruptHistory {
    pub move_no: usize,
    pub text: String,
}

#[derive(Debug, Error)]
#[error("illegal move {0}")]
pub struct IllegalMove(pub String);

/// Replays the recorded half-moves from the start position.
pub fn position_from_history(history: &[String]) -> Result<Chess, CorruptHistory> {
    let mut position = Chess::default();
    for (move_no, text) in history.iter().enumerate() {
        let corrupt = || CorruptHistory {
            move_no,
            text: text.clone(),
        };
        let uci = Uci::from_ascii(text.as_bytes()).map_err(|_| corrupt())?;
        let m = uci.to_move(&position).map_err(|_| corrupt())?;
        position = position.play(&m).map_err(|_| corrupt())?;
    }
    Ok(position)
}

pub fn turn(position: &Chess) -> PlayerColor {
    match position.turn() {
        shakmaty::Color::White => PlayerColor::White,
        shakmaty::Color::Black => PlayerColor::Black,
    }
}

/// Validates `input` against `position` and returns the successor position
/// together with the canonical UCI text that goes into the history.
pub fn try_move(position: &Chess, input: &MoveInput) -> Result<(Chess, String), IllegalMove> {
    let text = input.uci_text();
    let illegal = || IllegalMove(text.clone());
    let uci = Uci::from_ascii(text.as_bytes()).map_err(|_| illegal())?;
    let m = uci.to_move(position).map_err(|_| illegal())?;
    let canonical = m.to_uci(CastlingMode::Standard).to_string();
    let next = position.clone().play(&m).map_err(|_| illegal())?;
    Ok((next, canonical))
}

/// Checks whether the position ends the game on the board: checkmate,
/// stalemate, or a dead position. Clock- and agreement-based endings are
/// decided elsewhere.
pub fn game_over(position: &Chess) -> Option<(GameResult, ResultReason)> {
    match position.outcome() {
        Some(Outcome::Decisive { winner }) => {
            let winner = match winner {
                shakmaty::Color::White => PlayerColor::White,
                shakmaty::Color::Black => PlayerColor::Black,
            };
            Some((GameResult::win_for(winner), ResultReason::Checkmate))
        }
        Some(Outcome::Draw) => {
            if position.is_stalemate() {
                Some((GameResult::Draw, ResultReason::Stalemate))
            } else {
                Some((GameResult::Draw, ResultReason::Draw))
            }
        }
        None => None,
    }
}

pub fn is_valid_square(text: &str) -> bool {
    text.parse::<Square>().is_ok()
}

pub fn is_valid_promotion(piece: char) -> bool {
    matches!(Role::from_char(piece.to_ascii_lowercase()), Some(role) if role != Role::King && role != Role::Pawn)
}
