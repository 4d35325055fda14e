//! The premove queue: one slot per game and color, holding a move a player
//! committed to while it was not their turn. The queue is the in-process
//! authority on the hot path; the store carries a shadow copy purely for
//! rehydration after a restart or when another node first touches the game.
//!
//! Only the shape of a premove is checked at set time. Legality is decided
//! at execution, against the position at that instant.

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;
use crate::game::{GameId, PlayerColor};
use crate::rules::{self, MoveInput};

/// A queued premove plus the metadata needed for tracing and staleness
/// checks. Mirrored verbatim into the store's shadow column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedPremove {
    #[serde(flatten)]
    pub input: MoveInput,
    pub set_at_ms: i64,
    /// Length of the history at the time the premove was queued.
    pub source_move_no: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Why a slot was emptied. Broadcast to the room so clients can update
/// their affordances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    Cancelled,
    Rejected,
    Executed,
    GameOver,
}

/// Shape check for an incoming premove. Anything deeper than coordinates
/// and promotion letters waits until execution.
pub fn validate_shape(input: &MoveInput) -> Result<(), ServerError> {
    if !rules::is_valid_square(&input.from) || !rules::is_valid_square(&input.to) {
        return Err(ServerError::InvalidPremove(
            "premove squares must be valid board coordinates".to_owned(),
        ));
    }
    if input.from.eq_ignore_ascii_case(&input.to) {
        return Err(ServerError::InvalidPremove(
            "premove must change squares".to_owned(),
        ));
    }
    if let Some(promotion) = input.promotion {
        if !rules::is_valid_promotion(promotion) {
            return Err(ServerError::InvalidPremove(
                "promotion must be one of q, r, b, n".to_owned(),
            ));
        }
    }
    Ok(())
}

#[derive(Default)]
struct Slots {
    white: Option<QueuedPremove>,
    black: Option<QueuedPremove>,
}

impl Slots {
    fn get(&self, color: PlayerColor) -> &Option<QueuedPremove> {
        match color {
            PlayerColor::White => &self.white,
            PlayerColor::Black => &self.black,
        }
    }

    fn get_mut(&mut self, color: PlayerColor) -> &mut Option<QueuedPremove> {
        match color {
            PlayerColor::White => &mut self.white,
            PlayerColor::Black => &mut self.black,
        }
    }

    fn is_empty(&self) -> bool {
        self.white.is_none() && self.black.is_none()
    }
}

/// Per-game premove slots. Owned by the server instance and injected into
/// the coordinator; mutated only under the per-game lock, read lock-free on
/// the hot path.
#[derive(Default)]
pub struct PremoveQueue {
    slots: DashMap<GameId, Slots>,
}

impl PremoveQueue {
    pub fn new() -> PremoveQueue {
        PremoveQueue::default()
    }

    /// Stores a premove, overwriting any previous one for that color.
    pub fn set(&self, game_id: &str, color: PlayerColor, premove: QueuedPremove) {
        let mut entry = self.slots.entry(game_id.to_owned()).or_default();
        *entry.get_mut(color) = Some(premove);
    }

    pub fn get(&self, game_id: &str, color: PlayerColor) -> Option<QueuedPremove> {
        self.slots
            .get(game_id)
            .and_then(|slots| slots.get(color).clone())
    }

    /// Empties one slot. The entry is removed entirely once both slots are
    /// empty, so the map does not grow with finished games.
    pub fn clear(&self, game_id: &str, color: PlayerColor, reason: ClearReason) {
        // The entry API holds the shard lock across the emptiness check, so
        // a concurrent set cannot fall into a gap between check and removal.
        if let Entry::Occupied(mut entry) = self.slots.entry(game_id.to_owned()) {
            if entry.get().get(color).is_some() {
                debug!("clearing {:?} premove for game {game_id}: {reason:?}", color);
            }
            *entry.get_mut().get_mut(color) = None;
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Empties both slots. Idempotent.
    pub fn clear_all(&self, game_id: &str, reason: ClearReason) {
        if self.slots.remove(game_id).is_some() {
            debug!("clearing all premoves for game {game_id}: {reason:?}");
        }
    }

    /// Seeds the queue from the store's shadow copy. A no-op when the queue
    /// already holds something for this game: the in-process copy wins.
    pub fn rehydrate(
        &self,
        game_id: &str,
        white: Option<QueuedPremove>,
        black: Option<QueuedPremove>,
    ) {
        if white.is_none() && black.is_none() {
            return;
        }
        if let Entry::Vacant(entry) = self.slots.entry(game_id.to_owned()) {
            debug!("rehydrating premove slots for game {game_id}");
            entry.insert(Slots { white, black });
        }
    }

    pub fn is_empty(&self, game_id: &str) -> bool {
        self.slots
            .get(game_id)
            .map(|slots| slots.is_empty())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn premove(from: &str, to: &str) -> QueuedPremove {
        QueuedPremove {
            input: MoveInput {
                from: from.to_owned(),
                to: to.to_owned(),
                promotion: None,
            },
            set_at_ms: 1_000,
            source_move_no: 0,
            trace_id: None,
        }
    }

    #[test]
    fn set_get_clear() {
        let queue = PremoveQueue::new();
        assert_eq!(queue.get("g1", PlayerColor::Black), None);

        queue.set("g1", PlayerColor::Black, premove("d7", "d5"));
        assert_eq!(
            queue.get("g1", PlayerColor::Black),
            Some(premove("d7", "d5"))
        );
        assert_eq!(queue.get("g1", PlayerColor::White), None);
        assert!(!queue.is_empty("g1"));

        // Overwrite wins.
        queue.set("g1", PlayerColor::Black, premove("e7", "e5"));
        assert_eq!(
            queue.get("g1", PlayerColor::Black),
            Some(premove("e7", "e5"))
        );

        queue.clear("g1", PlayerColor::Black, ClearReason::Cancelled);
        assert_eq!(queue.get("g1", PlayerColor::Black), None);
        assert!(queue.is_empty("g1"));
    }

    #[test]
    fn clear_all_is_idempotent() {
        let queue = PremoveQueue::new();
        queue.set("g1", PlayerColor::White, premove("e2", "e4"));
        queue.set("g1", PlayerColor::Black, premove("d7", "d5"));

        queue.clear_all("g1", ClearReason::GameOver);
        assert!(queue.is_empty("g1"));
        queue.clear_all("g1", ClearReason::GameOver);
        assert!(queue.is_empty("g1"));
    }

    #[test]
    fn rehydrate_only_fills_an_empty_queue() {
        let queue = PremoveQueue::new();
        queue.rehydrate("g1", Some(premove("d7", "d5")), None);
        assert_eq!(
            queue.get("g1", PlayerColor::White),
            Some(premove("d7", "d5"))
        );

        // A second rehydration does not clobber the live copy.
        queue.rehydrate("g1", Some(premove("e7", "e5")), None);
        assert_eq!(
            queue.get("g1", PlayerColor::White),
            Some(premove("d7", "d5"))
        );

        // Rehydrating nothing leaves no entry behind.
        queue.rehydrate("g2", None, None);
        assert!(queue.is_empty("g2"));
    }

    #[test]
    fn shape_validation() {
        assert!(validate_shape(&MoveInput {
            from: "e2".to_owned(),
            to: "e4".to_owned(),
            promotion: None,
        })
        .is_ok());

        assert!(validate_shape(&MoveInput {
            from: "e2".to_owned(),
            to: "e2".to_owned(),
            promotion: None,
        })
        .is_err());

        assert!(validate_shape(&MoveInput {
            from: "z9".to_owned(),
            to: "e4".to_owned(),
            promotion: None,
        })
        .is_err());

        assert!(validate_shape(&MoveInput {
            from: "e7".to_owned(),
            to: "e8".to_owned(),
            promotion: Some('q'),
        })
        .is_ok());

        assert!(validate_shape(&MoveInput {
            from: "e7".to_owned(),
            to: "e8".to_owned(),
            promotion: Some('k'),
        })
        .is_err());
    }
}
