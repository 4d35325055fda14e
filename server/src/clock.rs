//! The chess clock as a pure transformation over a snapshot. Nothing in here
//! touches the store, the fabric, or the wall clock; callers read
//! `Utc::now()` once and pass it in, which keeps every branch testable with
//! hand-picked timestamps.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::{PlayerColor, TimeControl};

/// Network delay credited back to the mover is capped here.
pub const LAG_COMPENSATION_CAP_MS: i64 = 500;

/// White must make the first move within this window or the game is aborted.
pub const FIRST_MOVE_DEADLINE_MS: i64 = 30_000;

/// Current wall clock in integer milliseconds, the unit everything below
/// works in.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One committed view of both clocks. Persisted as a JSON column and
/// broadcast to clients; all fields are integer milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSnapshot {
    pub white_ms: i64,
    pub black_ms: i64,
    /// `None` before the first move and after the game stops.
    pub active_color: Option<PlayerColor>,
    pub last_move_at_ms: i64,
    pub first_move_deadline_ms: Option<i64>,
    /// Half-moves committed to the clock. The first move counts as one.
    pub move_count: u32,
    pub base_ms: i64,
    pub increment_ms: i64,
}

impl ClockSnapshot {
    pub fn initial(time_control: &TimeControl, now_ms: i64) -> ClockSnapshot {
        ClockSnapshot {
            white_ms: time_control.base_ms(),
            black_ms: time_control.base_ms(),
            active_color: None,
            last_move_at_ms: now_ms,
            first_move_deadline_ms: Some(now_ms + FIRST_MOVE_DEADLINE_MS),
            move_count: 0,
            base_ms: time_control.base_ms(),
            increment_ms: time_control.increment_ms(),
        }
    }

    fn remaining(&self, color: PlayerColor) -> i64 {
        match color {
            PlayerColor::White => self.white_ms,
            PlayerColor::Black => self.black_ms,
        }
    }

    fn remaining_mut(&mut self, color: PlayerColor) -> &mut i64 {
        match color {
            PlayerColor::White => &mut self.white_ms,
            PlayerColor::Black => &mut self.black_ms,
        }
    }

    /// Stops the clock. Used by terminal transitions so that a completed
    /// game never has an active side.
    pub fn stopped(mut self) -> ClockSnapshot {
        self.active_color = None;
        self.first_move_deadline_ms = None;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("it is not that player's turn on the clock")]
    WrongTurn,
}

/// Result of committing a move to the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved {
        snapshot: ClockSnapshot,
        /// How much network delay was credited back, for instrumentation.
        lag_compensated_ms: i64,
    },
    /// A side ran out of time. The turn is not flipped and `move_count`
    /// is not incremented; the move that triggered this is not committed.
    FlagFall {
        snapshot: ClockSnapshot,
        flagged: PlayerColor,
    },
}

/// Commits one move by `moving` to the clock.
///
/// The first move by White starts the clock without deducting time or
/// granting an increment; Black becomes the active side. Every later move
/// deducts the elapsed time since the previous move, credits back capped lag
/// compensation when the client supplied a plausible send timestamp, adds
/// the increment, and then checks for a flag fall before flipping the turn.
pub fn apply_move(
    snapshot: &ClockSnapshot,
    moving: PlayerColor,
    client_timestamp_ms: Option<i64>,
    now_ms: i64,
) -> Result<MoveOutcome, ClockError> {
    let mut next = snapshot.clone();

    let Some(active) = next.active_color else {
        // Clock not started yet. Only White may make the first move.
        if moving != PlayerColor::White {
            return Err(ClockError::WrongTurn);
        }
        next.active_color = Some(PlayerColor::Black);
        next.last_move_at_ms = now_ms;
        next.first_move_deadline_ms = None;
        next.move_count = 1;
        return Ok(MoveOutcome::Moved {
            snapshot: next,
            lag_compensated_ms: 0,
        });
    };

    if active != moving {
        return Err(ClockError::WrongTurn);
    }

    let elapsed = now_ms - next.last_move_at_ms;
    *next.remaining_mut(moving) -= elapsed;

    // An invalid or future client timestamp yields zero compensation,
    // never a negative credit.
    let lag_compensated_ms = match client_timestamp_ms {
        Some(sent) if sent > 0 && sent <= now_ms => (now_ms - sent).min(LAG_COMPENSATION_CAP_MS),
        _ => 0,
    };
    *next.remaining_mut(moving) += lag_compensated_ms;

    *next.remaining_mut(moving) += next.increment_ms;

    for side in [PlayerColor::White, PlayerColor::Black] {
        if next.remaining(side) <= 0 {
            // Committed snapshots never carry negative time.
            *next.remaining_mut(side) = 0;
            return Ok(MoveOutcome::FlagFall {
                snapshot: next,
                flagged: side,
            });
        }
    }

    next.active_color = Some(moving.other());
    next.last_move_at_ms = now_ms;
    next.move_count += 1;

    Ok(MoveOutcome::Moved {
        snapshot: next,
        lag_compensated_ms,
    })
}

/// Remaining time for both sides if the active side were to move at `now`.
/// Used for UI broadcasts and for the watcher's flag-fall scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockProjection {
    pub white_ms: i64,
    pub black_ms: i64,
    pub timed_out: Option<PlayerColor>,
}

pub fn project(snapshot: &ClockSnapshot, now_ms: i64) -> ClockProjection {
    let mut white_ms = snapshot.white_ms;
    let mut black_ms = snapshot.black_ms;
    let mut timed_out = None;

    if let Some(active) = snapshot.active_color {
        let elapsed = (now_ms - snapshot.last_move_at_ms).max(0);
        let remaining = match active {
            PlayerColor::White => &mut white_ms,
            PlayerColor::Black => &mut black_ms,
        };
        *remaining -= elapsed;
        if *remaining <= 0 {
            *remaining = 0;
            timed_out = Some(active);
        }
    }

    ClockProjection {
        white_ms: white_ms.max(0),
        black_ms: black_ms.max(0),
        timed_out,
    }
}
