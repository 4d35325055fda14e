//! The game coordinator: every gameplay operation runs here, inside the
//! per-game critical section. The move pipeline is
//! *validate → clock → commit to memory → broadcast → persist async →
//! try premove*; broadcasts deliberately go out before the durable write
//! because the in-memory record is already authoritative and broadcast
//! latency dominates the user-perceived move commit time. Do not quietly
//! convert this to persist-first.
//!
//! The one exception is a terminal transition: there the conditional-update
//! latch must win *before* anything is emitted, because that latch is what
//! makes `game_over` (and the stats side effect) exactly-once under
//! concurrent terminators.

use std::sync::Arc;
use std::time::Instant;

use crate::clock::{self, MoveOutcome};
use crate::db::game::{GamePatch, GameStore, UpdatePredicate};
use crate::error::ServerError;
use crate::events::{
    GameRef, GameStatePayload, JoinGamePayload, MakeMovePayload, ServerEvent, SetPremovePayload,
};
use crate::fabric::{SessionFabric, SocketId};
use crate::game::{Game, GameId, GameResult, GameStatus, ResultReason, UserId, MAX_DRAW_OFFERS};
use crate::locks::GameLocks;
use crate::premove::{self, ClearReason, PremoveQueue, QueuedPremove};
use crate::rules::{self, GamePosition};
use crate::stats::StatsSink;

/// Grace window a disconnected player gets before forfeiting.
pub const DISCONNECT_GRACE_MS: i64 = 20_000;

/// Who to tell, best effort, when an async persist for their action failed.
enum PersistNotify {
    Nobody,
    Socket(SocketId),
    User(UserId),
}

pub struct Coordinator {
    store: Arc<GameStore>,
    premoves: Arc<PremoveQueue>,
    fabric: Arc<SessionFabric>,
    stats: Arc<dyn StatsSink>,
    locks: GameLocks,
}

impl Coordinator {
    pub fn new(
        store: Arc<GameStore>,
        premoves: Arc<PremoveQueue>,
        fabric: Arc<SessionFabric>,
        stats: Arc<dyn StatsSink>,
    ) -> Coordinator {
        Coordinator {
            store,
            premoves,
            fabric,
            stats,
            locks: GameLocks::new(),
        }
    }

    pub fn store(&self) -> &GameStore {
        &self.store
    }

    pub fn fabric(&self) -> &SessionFabric {
        &self.fabric
    }

    /// Loads an ongoing game and reseeds the premove queue from the durable
    /// shadow if this process has not touched the game yet.
    async fn load_ongoing(&self, game_id: &str) -> Result<Game, ServerError> {
        let game = self
            .store
            .load(game_id)
            .await?
            .ok_or(ServerError::GameNotFound)?;
        if !game.is_ongoing() {
            return Err(ServerError::GameAlreadyOver);
        }
        self.rehydrate_premoves(&game);
        Ok(game)
    }

    fn rehydrate_premoves(&self, game: &Game) {
        if (game.premove_white.is_some() || game.premove_black.is_some())
            && self.premoves.is_empty(&game.id)
        {
            self.premoves.rehydrate(
                &game.id,
                game.premove_white.clone(),
                game.premove_black.clone(),
            );
        }
    }

    fn clock_update_event(game: &Game, now_ms: i64) -> ServerEvent {
        let projection = clock::project(&game.clock, now_ms);
        ServerEvent::ClockUpdate {
            game_id: game.id.clone(),
            white_ms: projection.white_ms,
            black_ms: projection.black_ms,
            active_color: game.clock.active_color,
        }
    }

    /// Queues a narrow durable write and returns immediately. A listener
    /// task delivers the best-effort "sync error" notification if the write
    /// fails; the in-memory state is not rolled back.
    fn persist_async(&self, game_id: &str, patch: GamePatch, notify: PersistNotify) {
        let receiver = self.store.queue_patch(game_id, patch);
        let fabric = self.fabric.clone();
        tokio::spawn(async move {
            if let Ok(Err(_)) = receiver.await {
                let event = ServerEvent::Error {
                    message: "sync error".to_owned(),
                };
                match notify {
                    PersistNotify::Nobody => {}
                    PersistNotify::Socket(socket) => fabric.send_to(socket, event),
                    PersistNotify::User(user) => fabric.emit_user(&user, &event),
                }
            }
        });
    }

    /// Funnels a terminal transition through the conditional-update latch.
    ///
    /// Only the winner emits: first `pre_events` (the caller controls the
    /// order of `move_made`/`clock_update`/`premove_cleared` relative to the
    /// termination), then `game_over`, then the stats side effect for
    /// counted results. Returns whether this caller won the latch.
    async fn commit_termination(
        &self,
        game: &mut Game,
        result: GameResult,
        reason: ResultReason,
        expected_disconnect: Option<&UserId>,
        mut patch: GamePatch,
        pre_events: Vec<ServerEvent>,
    ) -> Result<bool, ServerError> {
        game.status = GameStatus::Completed;
        game.result = Some(result);
        game.result_reason = Some(reason);
        game.clock = game.clock.clone().stopped();
        game.premove_white = None;
        game.premove_black = None;

        patch.status = Some(GameStatus::Completed);
        patch.result = Some(result);
        patch.result_reason = Some(reason);
        patch.clock = Some(game.clock.clone());
        patch.premove_white = Some(None);
        patch.premove_black = Some(None);

        let predicate = match expected_disconnect {
            Some(user) => UpdatePredicate::ongoing_with_disconnect(user),
            None => UpdatePredicate::ongoing(),
        };

        let won = self
            .store
            .conditional_update(&game.id, predicate, patch)
            .await?;
        if !won {
            debug!("lost the termination race for game {}", game.id);
            return Ok(false);
        }

        self.premoves.clear_all(&game.id, ClearReason::GameOver);
        for event in &pre_events {
            self.fabric.emit_game(&game.id, event);
        }
        self.fabric.emit_game(
            &game.id,
            &ServerEvent::GameOver {
                game_id: game.id.clone(),
                result,
                reason,
            },
        );

        // Aborted games are excluded from stats.
        if result != GameResult::Aborted {
            game.stats_applied = true;
            self.stats.record_result(game);
            self.persist_async(
                &game.id,
                GamePatch {
                    stats_applied: Some(true),
                    ..Default::default()
                },
                PersistNotify::Nobody,
            );
        }
        Ok(true)
    }

    /// The hot path. Validates and commits one move, broadcasts, schedules
    /// the narrow persist, and then gives the opponent's queued premove its
    /// one chance to fire — all without releasing the game lock, so nothing
    /// can interleave between the move's commit and the premove attempt.
    pub async fn make_move(
        &self,
        origin: SocketId,
        user: &UserId,
        payload: MakeMovePayload,
    ) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        let position = rules::position_from_history(&game.history)?;
        if rules::turn(&position) != color {
            return Err(ServerError::NotYourTurn);
        }
        let (next_position, uci) = rules::try_move(&position, &payload.mv)
            .map_err(|error| ServerError::IllegalMove(error.0))?;

        // An explicit move overrides the mover's own queued premove.
        let mut cleared_own_premove = false;
        if game.premove(color).is_some() || self.premoves.get(&game.id, color).is_some() {
            self.premoves.clear(&game.id, color, ClearReason::Cancelled);
            *game.premove_mut(color) = None;
            cleared_own_premove = true;
        }
        let premove_cleared_event = ServerEvent::PremoveCleared {
            game_id: game.id.clone(),
            by: color,
            reason: ClearReason::Cancelled,
        };

        let now = clock::now_ms();
        match clock::apply_move(&game.clock, color, payload.client_timestamp, now)
            .map_err(|_| ServerError::NotYourTurn)?
        {
            MoveOutcome::FlagFall { snapshot, flagged } => {
                // The move is not committed; the flag fell first.
                game.clock = snapshot.stopped();
                let mut pre = Vec::new();
                if cleared_own_premove {
                    pre.push(premove_cleared_event);
                }
                pre.push(Self::clock_update_event(&game, now));
                let mut patch = GamePatch::default();
                if cleared_own_premove {
                    patch.set_premove_slot(color, None);
                }
                let won = self
                    .commit_termination(
                        &mut game,
                        GameResult::win_for(flagged.other()),
                        ResultReason::Timeout,
                        None,
                        patch,
                        pre,
                    )
                    .await?;
                return if won {
                    Ok(())
                } else {
                    Err(ServerError::GameAlreadyOver)
                };
            }
            MoveOutcome::Moved {
                snapshot,
                lag_compensated_ms,
            } => {
                if lag_compensated_ms > 0 {
                    trace!(
                        "credited {lag_compensated_ms}ms of lag to {:?} in game {} trace={:?}",
                        color,
                        game.id,
                        payload.trace_id
                    );
                }
                game.clock = snapshot;
            }
        }

        game.history.push(uci.clone());
        let move_no = game.history.len();
        let move_made_event = ServerEvent::MoveMade {
            game_id: game.id.clone(),
            by: color,
            mv: uci,
            move_no,
        };

        if let Some((result, reason)) = rules::game_over(&next_position) {
            game.clock = game.clock.clone().stopped();
            let mut pre = Vec::new();
            if cleared_own_premove {
                pre.push(premove_cleared_event);
            }
            pre.push(move_made_event);
            pre.push(Self::clock_update_event(&game, now));
            let mut patch = GamePatch {
                history: Some(game.history.clone()),
                ..Default::default()
            };
            if cleared_own_premove {
                patch.set_premove_slot(color, None);
            }
            let won = self
                .commit_termination(&mut game, result, reason, None, patch, pre)
                .await?;
            return if won {
                Ok(())
            } else {
                Err(ServerError::GameAlreadyOver)
            };
        }

        // Commit to memory, then broadcast before the durable write lands.
        self.store.commit(&game);
        if cleared_own_premove {
            self.fabric.emit_game(&game.id, &premove_cleared_event);
        }
        self.fabric.emit_game(&game.id, &move_made_event);
        self.fabric
            .emit_game(&game.id, &Self::clock_update_event(&game, now));

        let mut patch = GamePatch {
            history: Some(game.history.clone()),
            clock: Some(game.clock.clone()),
            ..Default::default()
        };
        if cleared_own_premove {
            patch.set_premove_slot(color, None);
        }
        self.persist_async(&game.id, patch, PersistNotify::Socket(origin));

        self.try_execute_queued_premove(&mut game, next_position)
            .await
    }

    /// The latency-critical sub-pipeline: runs right after a normal move
    /// commits, while the game lock is still held. At most one queued
    /// premove fires per turn-flip; an executed premove never triggers the
    /// other side's premove in turn.
    async fn try_execute_queued_premove(
        &self,
        game: &mut Game,
        position: GamePosition,
    ) -> Result<(), ServerError> {
        let to_move = rules::turn(&position);
        let Some(queued) = self.premoves.get(&game.id, to_move) else {
            return Ok(());
        };

        let started = Instant::now();
        trace!(
            "turn_flipped game={} premove_by={:?} trace={:?}",
            game.id,
            to_move,
            queued.trace_id
        );

        match rules::try_move(&position, &queued.input) {
            Err(error) => {
                // Speculation failed: the premove is illegal against the
                // position it actually met.
                self.premoves.clear(&game.id, to_move, ClearReason::Rejected);
                *game.premove_mut(to_move) = None;
                self.store.commit(game);
                self.fabric.emit_user(
                    game.player(to_move),
                    &ServerEvent::PremoveRejected {
                        game_id: game.id.clone(),
                        by: to_move,
                        message: error.to_string(),
                    },
                );
                self.fabric.emit_game(
                    &game.id,
                    &ServerEvent::PremoveCleared {
                        game_id: game.id.clone(),
                        by: to_move,
                        reason: ClearReason::Rejected,
                    },
                );
                let mut patch = GamePatch::default();
                patch.set_premove_slot(to_move, None);
                self.persist_async(&game.id, patch, PersistNotify::Nobody);
            }
            Ok((next_position, uci)) => {
                let now = clock::now_ms();
                // Premoves carry no client timestamp; no lag compensation.
                let outcome = clock::apply_move(&game.clock, to_move, None, now).map_err(|_| {
                    ServerError::CorruptGame("clock out of step with the position".to_owned())
                })?;
                match outcome {
                    MoveOutcome::FlagFall { snapshot, flagged } => {
                        game.clock = snapshot.stopped();
                        let pre = vec![Self::clock_update_event(game, now)];
                        self.commit_termination(
                            game,
                            GameResult::win_for(flagged.other()),
                            ResultReason::Timeout,
                            None,
                            GamePatch::default(),
                            pre,
                        )
                        .await?;
                    }
                    MoveOutcome::Moved { snapshot, .. } => {
                        game.clock = snapshot;
                        game.history.push(uci.clone());
                        let move_no = game.history.len();
                        self.premoves.clear(&game.id, to_move, ClearReason::Executed);
                        *game.premove_mut(to_move) = None;

                        let move_made_event = ServerEvent::MoveMade {
                            game_id: game.id.clone(),
                            by: to_move,
                            mv: uci,
                            move_no,
                        };
                        let cleared_event = ServerEvent::PremoveCleared {
                            game_id: game.id.clone(),
                            by: to_move,
                            reason: ClearReason::Executed,
                        };

                        if let Some((result, reason)) = rules::game_over(&next_position) {
                            game.clock = game.clock.clone().stopped();
                            let pre = vec![
                                move_made_event,
                                Self::clock_update_event(game, now),
                                cleared_event,
                            ];
                            let patch = GamePatch {
                                history: Some(game.history.clone()),
                                ..Default::default()
                            };
                            self.commit_termination(game, result, reason, None, patch, pre)
                                .await?;
                        } else {
                            self.store.commit(game);
                            self.fabric.emit_game(&game.id, &move_made_event);
                            self.fabric
                                .emit_game(&game.id, &Self::clock_update_event(game, now));
                            self.fabric.emit_game(&game.id, &cleared_event);

                            let mut patch = GamePatch {
                                history: Some(game.history.clone()),
                                clock: Some(game.clock.clone()),
                                ..Default::default()
                            };
                            patch.set_premove_slot(to_move, None);
                            self.persist_async(
                                &game.id,
                                patch,
                                PersistNotify::User(game.player(to_move).clone()),
                            );
                        }
                    }
                }
            }
        }

        debug!(
            "premove pipeline for game {} finished in {}us",
            game.id,
            started.elapsed().as_micros()
        );
        Ok(())
    }

    /// Queues a premove. Shape is checked here; legality is not — that is
    /// decided when (and if) the premove executes on turn-flip.
    pub async fn set_premove(
        &self,
        origin: SocketId,
        user: &UserId,
        payload: SetPremovePayload,
    ) -> Result<(), ServerError> {
        premove::validate_shape(&payload.premove)?;

        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        let position = rules::position_from_history(&game.history)?;
        if rules::turn(&position) == color {
            return Err(ServerError::PremoveOnYourTurn);
        }

        let queued = QueuedPremove {
            input: payload.premove,
            set_at_ms: clock::now_ms(),
            source_move_no: game.history.len(),
            trace_id: payload.trace_id,
        };
        self.premoves.set(&game.id, color, queued.clone());
        *game.premove_mut(color) = Some(queued.clone());
        self.store.commit(&game);

        self.fabric.emit_game(
            &game.id,
            &ServerEvent::PremoveSet {
                game_id: game.id.clone(),
                by: color,
                premove: queued.clone(),
            },
        );

        let mut patch = GamePatch::default();
        patch.set_premove_slot(color, Some(queued));
        self.persist_async(&game.id, patch, PersistNotify::Socket(origin));
        Ok(())
    }

    pub async fn cancel_premove(
        &self,
        origin: SocketId,
        user: &UserId,
        payload: GameRef,
    ) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.premove(color).is_none() && self.premoves.get(&game.id, color).is_none() {
            return Ok(());
        }
        self.premoves.clear(&game.id, color, ClearReason::Cancelled);
        *game.premove_mut(color) = None;
        self.store.commit(&game);

        self.fabric.emit_game(
            &game.id,
            &ServerEvent::PremoveCleared {
                game_id: game.id.clone(),
                by: color,
                reason: ClearReason::Cancelled,
            },
        );
        let mut patch = GamePatch::default();
        patch.set_premove_slot(color, None);
        self.persist_async(&game.id, patch, PersistNotify::Socket(origin));
        Ok(())
    }

    pub async fn resign(&self, user: &UserId, payload: GameRef) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        let won = self
            .commit_termination(
                &mut game,
                GameResult::win_for(color.other()),
                ResultReason::Resignation,
                None,
                GamePatch::default(),
                Vec::new(),
            )
            .await?;
        if won {
            Ok(())
        } else {
            Err(ServerError::GameAlreadyOver)
        }
    }

    pub async fn offer_draw(
        &self,
        origin: SocketId,
        user: &UserId,
        payload: GameRef,
    ) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.pending_draw_offer_from.is_some() {
            return Err(ServerError::DrawOfferPending);
        }
        if game.draw_offers(color) >= MAX_DRAW_OFFERS {
            return Err(ServerError::DrawOfferLimit);
        }

        game.pending_draw_offer_from = Some(color);
        *game.draw_offers_mut(color) += 1;
        self.store.commit(&game);

        // Both players' user rooms: the opponent on every device, and the
        // offerer's other tabs so they can grey out the button too.
        let event = ServerEvent::DrawOffered {
            game_id: game.id.clone(),
            by: color,
        };
        self.fabric.emit_user(&game.white_player, &event);
        self.fabric.emit_user(&game.black_player, &event);

        self.persist_async(
            &game.id,
            GamePatch {
                pending_draw_offer_from: Some(Some(color)),
                white_draw_offers: Some(game.white_draw_offers),
                black_draw_offers: Some(game.black_draw_offers),
                ..Default::default()
            },
            PersistNotify::Socket(origin),
        );
        Ok(())
    }

    pub async fn accept_draw(&self, user: &UserId, payload: GameRef) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.pending_draw_offer_from != Some(color.other()) {
            return Err(ServerError::NoDrawOffer);
        }
        game.pending_draw_offer_from = None;

        let won = self
            .commit_termination(
                &mut game,
                GameResult::Draw,
                ResultReason::DrawAgreed,
                None,
                GamePatch {
                    pending_draw_offer_from: Some(None),
                    ..Default::default()
                },
                Vec::new(),
            )
            .await?;
        if won {
            Ok(())
        } else {
            Err(ServerError::GameAlreadyOver)
        }
    }

    pub async fn reject_draw(
        &self,
        origin: SocketId,
        user: &UserId,
        payload: GameRef,
    ) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.pending_draw_offer_from != Some(color.other()) {
            return Err(ServerError::NoDrawOffer);
        }
        game.pending_draw_offer_from = None;
        self.store.commit(&game);

        self.fabric.emit_game(
            &game.id,
            &ServerEvent::DrawRejected {
                game_id: game.id.clone(),
                by: color,
            },
        );
        self.persist_async(
            &game.id,
            GamePatch {
                pending_draw_offer_from: Some(None),
                ..Default::default()
            },
            PersistNotify::Socket(origin),
        );
        Ok(())
    }

    /// Aborts a barely-started game. Allowed only before the second move.
    pub async fn cancel_early(&self, user: &UserId, payload: GameRef) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let mut game = self.load_ongoing(&payload.game_id).await?;
        game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.history.len() >= 2 {
            return Err(ServerError::TooLateToCancel);
        }

        let won = self
            .commit_termination(
                &mut game,
                GameResult::Aborted,
                ResultReason::CancelledDueToFirstMoveTimeout,
                None,
                GamePatch::default(),
                Vec::new(),
            )
            .await?;
        if won {
            Ok(())
        } else {
            Err(ServerError::GameAlreadyOver)
        }
    }

    pub async fn offer_rematch(&self, user: &UserId, payload: GameRef) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let game = self
            .store
            .load(&payload.game_id)
            .await?
            .ok_or(ServerError::GameNotFound)?;
        if game.is_ongoing() {
            return Err(ServerError::GameStillOngoing);
        }
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.rematch_declined || game.next_game_id.is_some() || game.rematch_offer_from.is_some()
        {
            return Err(ServerError::RematchUnavailable);
        }

        self.store
            .patch_now(
                &game.id,
                GamePatch {
                    rematch_offer_from: Some(Some(color)),
                    ..Default::default()
                },
            )
            .await?;
        self.fabric.emit_game(
            &game.id,
            &ServerEvent::RematchOffered {
                game_id: game.id.clone(),
                by: color,
            },
        );
        Ok(())
    }

    /// Accepting creates the follow-up game with colors swapped and a fresh
    /// clock, and links it from the finished one.
    pub async fn accept_rematch(
        &self,
        user: &UserId,
        payload: GameRef,
    ) -> Result<GameId, ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let game = self
            .store
            .load(&payload.game_id)
            .await?
            .ok_or(ServerError::GameNotFound)?;
        if game.is_ongoing() {
            return Err(ServerError::GameStillOngoing);
        }
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.rematch_offer_from != Some(color.other())
            || game.rematch_declined
            || game.next_game_id.is_some()
        {
            return Err(ServerError::RematchUnavailable);
        }

        let now = clock::now_ms();
        let new_game_id = uuid::Uuid::new_v4().to_string();
        let new_game = Game::new(
            new_game_id.clone(),
            game.black_player.clone(),
            game.white_player.clone(),
            game.time_control.clone(),
            now,
        );
        self.store.create(&new_game).await?;
        info!(
            "rematch of game {} created as game {new_game_id}",
            game.id
        );

        self.store
            .patch_now(
                &game.id,
                GamePatch {
                    next_game_id: Some(new_game_id.clone()),
                    rematch_offer_from: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.fabric.emit_game(
            &game.id,
            &ServerEvent::RematchAccepted {
                game_id: game.id.clone(),
                new_game_id: new_game_id.clone(),
            },
        );
        Ok(new_game_id)
    }

    pub async fn reject_rematch(&self, user: &UserId, payload: GameRef) -> Result<(), ServerError> {
        let _guard = self.locks.acquire(&payload.game_id).await;
        let game = self
            .store
            .load(&payload.game_id)
            .await?
            .ok_or(ServerError::GameNotFound)?;
        if game.is_ongoing() {
            return Err(ServerError::GameStillOngoing);
        }
        let color = game.color_of(user).ok_or(ServerError::NotAPlayer)?;

        if game.rematch_offer_from != Some(color.other()) {
            return Err(ServerError::RematchUnavailable);
        }

        self.store
            .patch_now(
                &game.id,
                GamePatch {
                    rematch_declined: Some(true),
                    rematch_offer_from: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.fabric.emit_game(
            &game.id,
            &ServerEvent::RematchRejected {
                game_id: game.id.clone(),
            },
        );
        Ok(())
    }

    /// Joins a socket to a game room and replies with a full state snapshot.
    /// Read-mostly: only the reconnect-clear latch takes the game lock.
    pub async fn join_game(
        &self,
        socket: SocketId,
        user: &UserId,
        payload: JoinGamePayload,
    ) -> Result<(), ServerError> {
        let mut game = self
            .store
            .load(&payload.game_id)
            .await?
            .ok_or(ServerError::GameNotFound)?;
        self.rehydrate_premoves(&game);
        self.fabric.join_game_room(socket, &game.id);

        if game.is_ongoing() && game.disconnected_player.as_ref() == Some(user) {
            // This races the timeout watcher harmlessly: whichever side wins
            // its conditional update is honored.
            let _guard = self.locks.acquire(&game.id).await;
            game = self
                .store
                .load(&payload.game_id)
                .await?
                .ok_or(ServerError::GameNotFound)?;
            if game.is_ongoing() && game.disconnected_player.as_ref() == Some(user) {
                let won = self
                    .store
                    .conditional_update(
                        &game.id,
                        UpdatePredicate::ongoing_with_disconnect(user),
                        GamePatch {
                            disconnect: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
                if won {
                    game.disconnected_player = None;
                    game.disconnect_deadline_ms = None;
                    self.fabric.emit_game(
                        &game.id,
                        &ServerEvent::OpponentReconnected {
                            game_id: game.id.clone(),
                            user_id: user.clone(),
                        },
                    );
                } else {
                    // The watcher beat us; show the caller the final state.
                    game = self
                        .store
                        .load(&payload.game_id)
                        .await?
                        .ok_or(ServerError::GameNotFound)?;
                }
            }
        }

        let now = clock::now_ms();
        self.fabric.send_to(
            socket,
            ServerEvent::GameState(GameStatePayload::for_viewer(&game, Some(user), now)),
        );
        if game.is_ongoing() && game.clock.active_color.is_some() {
            self.fabric
                .send_to(socket, Self::clock_update_event(&game, now));
        }
        if game.color_of(user).is_some() {
            self.fabric.emit_game(
                &game.id,
                &ServerEvent::OpponentJoined {
                    game_id: game.id.clone(),
                    user_id: user.clone(),
                },
            );
        }
        Ok(())
    }

    /// Explicit `leave_game`: the socket leaves the room, and if that was
    /// the user's last connection in the room the disconnect grace timer is
    /// armed just like on a dropped connection.
    pub async fn leave_game(
        &self,
        socket: SocketId,
        user: &UserId,
        payload: GameRef,
    ) -> Result<(), ServerError> {
        self.fabric.leave_game_room(socket, &payload.game_id);
        self.handle_player_departure(&payload.game_id, user).await
    }

    /// Called once a user has no remaining connection in a game's room.
    /// Arms the disconnect marker so the watcher can forfeit the game if
    /// they stay away past the grace window.
    pub async fn handle_player_departure(
        &self,
        game_id: &str,
        user: &UserId,
    ) -> Result<(), ServerError> {
        if self.fabric.user_present_in_game(game_id, user) {
            return Ok(());
        }

        let _guard = self.locks.acquire(game_id).await;
        let Some(game) = self.store.load(game_id).await? else {
            return Ok(());
        };
        if !game.is_ongoing() || game.color_of(user).is_none() {
            return Ok(());
        }
        // At most one pending disconnect per game; the predicate enforces
        // it even against a concurrent arm.
        if game.disconnected_player.is_some() {
            return Ok(());
        }

        let deadline = clock::now_ms() + DISCONNECT_GRACE_MS;
        let won = self
            .store
            .conditional_update(
                game_id,
                UpdatePredicate::ongoing_without_disconnect(),
                GamePatch {
                    disconnect: Some(Some((user.clone(), deadline))),
                    ..Default::default()
                },
            )
            .await?;
        if won {
            info!("armed disconnect grace for {user} in game {game_id}");
            self.fabric.emit_game(
                game_id,
                &ServerEvent::OpponentDisconnected {
                    game_id: game_id.to_owned(),
                    user_id: user.clone(),
                    reconnect_deadline_at: deadline,
                },
            );
        }
        Ok(())
    }

    /// Watcher path: the grace deadline passed but the user is in fact back
    /// in the room. Clears the marker instead of forfeiting.
    pub async fn clear_disconnect_after_reconnect(
        &self,
        game_id: &str,
        user: &UserId,
    ) -> Result<bool, ServerError> {
        let won = self
            .store
            .conditional_update(
                game_id,
                UpdatePredicate::ongoing_with_disconnect(user),
                GamePatch {
                    disconnect: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        if won {
            self.fabric.emit_game(
                game_id,
                &ServerEvent::OpponentReconnected {
                    game_id: game_id.to_owned(),
                    user_id: user.clone(),
                },
            );
        }
        Ok(won)
    }

    /// Watcher path: commits a terminal transition for a game the watcher
    /// found overdue. Runs without the game lock; the latch makes the race
    /// with any concurrent coordinator operation safe.
    pub async fn terminate_from_watcher(
        &self,
        game_id: &str,
        result: GameResult,
        reason: ResultReason,
        expected_disconnect: Option<&UserId>,
        with_clock_update: bool,
    ) -> Result<bool, ServerError> {
        let Some(mut game) = self.store.load(game_id).await? else {
            return Ok(false);
        };
        if !game.is_ongoing() {
            return Ok(false);
        }
        let now = clock::now_ms();
        let pre = if with_clock_update {
            vec![Self::clock_update_event(&game, now)]
        } else {
            Vec::new()
        };
        self.commit_termination(
            &mut game,
            result,
            reason,
            expected_disconnect,
            GamePatch::default(),
            pre,
        )
        .await
    }
}
