//! The game store: one row per game, with JSON columns for the structured
//! pieces (clock, time control, premove shadow slots) and scalar columns
//! where conditional-update predicates or the watcher scan need them
//! (`status`, the disconnect marker pair, `stats_applied`). Deadlines that
//! are only ever checked against a loaded record, like the first-move
//! window, stay inside the clock JSON.
//!
//! The store pairs the durable rows with an in-process cache. While a game
//! is ongoing the cache is the authority for reads on the hot path; the
//! database catches up through a single persister task that applies patches
//! in submission order. Because every gameplay write goes through that one
//! queue, a client that saw `move_made` for move N can never later read a
//! history shorter than N from the store.
//!
//! Terminal transitions are different: they run as conditional updates
//! (`status = 'ongoing'`, optionally the expected disconnect marker) and the
//! row count decides which of several racing terminators wins. That is the
//! exactly-once latch.

use dashmap::DashMap;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tokio::sync::{mpsc, oneshot};

use crate::clock::ClockSnapshot;
use crate::db::Pool;
use crate::error::ServerError;
use crate::game::{
    Game, GameId, GameResult, GameStatus, PlayerColor, ResultReason, TimeControl, UserId,
};
use crate::premove::QueuedPremove;

/// A set-of-fields update. Only fields that are `Some` are written; the
/// nested options distinguish "leave alone" from "set to null".
#[derive(Clone, Debug, Default)]
pub struct GamePatch {
    pub history: Option<Vec<String>>,
    pub status: Option<GameStatus>,
    pub result: Option<GameResult>,
    pub result_reason: Option<ResultReason>,
    pub clock: Option<ClockSnapshot>,
    pub premove_white: Option<Option<QueuedPremove>>,
    pub premove_black: Option<Option<QueuedPremove>>,
    /// Marker and deadline are always written together (or cleared together).
    pub disconnect: Option<Option<(UserId, i64)>>,
    pub stats_applied: Option<bool>,
    pub pending_draw_offer_from: Option<Option<PlayerColor>>,
    pub white_draw_offers: Option<u8>,
    pub black_draw_offers: Option<u8>,
    pub rematch_offer_from: Option<Option<PlayerColor>>,
    pub rematch_declined: Option<bool>,
    pub next_game_id: Option<GameId>,
}

impl GamePatch {
    pub fn set_premove_slot(&mut self, color: PlayerColor, slot: Option<QueuedPremove>) {
        match color {
            PlayerColor::White => self.premove_white = Some(slot),
            PlayerColor::Black => self.premove_black = Some(slot),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_none()
            && self.status.is_none()
            && self.result.is_none()
            && self.result_reason.is_none()
            && self.clock.is_none()
            && self.premove_white.is_none()
            && self.premove_black.is_none()
            && self.disconnect.is_none()
            && self.stats_applied.is_none()
            && self.pending_draw_offer_from.is_none()
            && self.white_draw_offers.is_none()
            && self.black_draw_offers.is_none()
            && self.rematch_offer_from.is_none()
            && self.rematch_declined.is_none()
            && self.next_game_id.is_none()
    }

    /// Mirrors the patch onto an in-memory record, keeping the cache in
    /// step with what a successful conditional update wrote to the row.
    pub fn apply_to(&self, game: &mut Game) {
        if let Some(history) = &self.history {
            game.history = history.clone();
        }
        if let Some(status) = self.status {
            game.status = status;
        }
        if let Some(result) = self.result {
            game.result = Some(result);
        }
        if let Some(reason) = self.result_reason {
            game.result_reason = Some(reason);
        }
        if let Some(clock) = &self.clock {
            game.clock = clock.clone();
        }
        if let Some(slot) = &self.premove_white {
            game.premove_white = slot.clone();
        }
        if let Some(slot) = &self.premove_black {
            game.premove_black = slot.clone();
        }
        if let Some(disconnect) = &self.disconnect {
            match disconnect {
                Some((user, deadline)) => {
                    game.disconnected_player = Some(user.clone());
                    game.disconnect_deadline_ms = Some(*deadline);
                }
                None => {
                    game.disconnected_player = None;
                    game.disconnect_deadline_ms = None;
                }
            }
        }
        if let Some(stats_applied) = self.stats_applied {
            game.stats_applied = stats_applied;
        }
        if let Some(offer) = self.pending_draw_offer_from {
            game.pending_draw_offer_from = offer;
        }
        if let Some(count) = self.white_draw_offers {
            game.white_draw_offers = count;
        }
        if let Some(count) = self.black_draw_offers {
            game.black_draw_offers = count;
        }
        if let Some(offer) = self.rematch_offer_from {
            game.rematch_offer_from = offer;
        }
        if let Some(declined) = self.rematch_declined {
            game.rematch_declined = declined;
        }
        if let Some(next) = &self.next_game_id {
            game.next_game_id = Some(next.clone());
        }
    }
}

/// The field-equality predicate a conditional update must match.
#[derive(Clone, Debug)]
pub struct UpdatePredicate {
    pub status: GameStatus,
    /// `None` = don't check; `Some(None)` = marker must be unset;
    /// `Some(Some(user))` = marker must name exactly this user.
    pub disconnected_player: Option<Option<UserId>>,
}

impl UpdatePredicate {
    pub fn ongoing() -> UpdatePredicate {
        UpdatePredicate {
            status: GameStatus::Ongoing,
            disconnected_player: None,
        }
    }

    pub fn ongoing_with_disconnect(user: &UserId) -> UpdatePredicate {
        UpdatePredicate {
            status: GameStatus::Ongoing,
            disconnected_player: Some(Some(user.clone())),
        }
    }

    pub fn ongoing_without_disconnect() -> UpdatePredicate {
        UpdatePredicate {
            status: GameStatus::Ongoing,
            disconnected_player: Some(None),
        }
    }
}

enum PersistJob {
    Patch {
        game_id: GameId,
        patch: GamePatch,
        reply: Option<oneshot::Sender<Result<(), ServerError>>>,
    },
    Conditional {
        game_id: GameId,
        predicate: UpdatePredicate,
        patch: GamePatch,
        reply: oneshot::Sender<Result<bool, ServerError>>,
    },
    /// Resolves once every job queued before it has been applied.
    Flush { reply: oneshot::Sender<()> },
}

pub struct GameStore {
    pool: Pool,
    cache: DashMap<GameId, Game>,
    jobs: mpsc::UnboundedSender<PersistJob>,
}

impl GameStore {
    /// Creates the store and spawns its persister task. Must be called from
    /// within a tokio runtime.
    pub fn new(pool: Pool) -> GameStore {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_persister(pool.clone(), rx));
        GameStore {
            pool,
            cache: DashMap::new(),
            jobs,
        }
    }

    /// Inserts a freshly created game. Ongoing games go straight into the
    /// cache so the first coordinator operation does not hit the database.
    pub async fn create(&self, game: &Game) -> Result<(), ServerError> {
        game.debug_check_invariants();
        insert_game(&self.pool, game).await?;
        if game.is_ongoing() {
            self.cache.insert(game.id.clone(), game.clone());
        }
        Ok(())
    }

    /// Loads a game, preferring the in-process copy. Completed games are
    /// served from the database and not cached.
    pub async fn load(&self, game_id: &str) -> Result<Option<Game>, ServerError> {
        if let Some(cached) = self.cache.get(game_id) {
            return Ok(Some(cached.clone()));
        }
        let loaded = select_game(&self.pool, game_id).await?;
        if let Some(game) = &loaded {
            if game.is_ongoing() {
                self.cache.insert(game.id.clone(), game.clone());
            }
        }
        Ok(loaded)
    }

    /// Commits a mutated record to the in-process cache. This is the point
    /// at which a transition becomes visible to every other reader; the
    /// durable write follows through the persister queue.
    pub fn commit(&self, game: &Game) {
        game.debug_check_invariants();
        self.cache.insert(game.id.clone(), game.clone());
    }

    /// Drops the cached copy, e.g. once a game has completed.
    pub fn evict(&self, game_id: &str) {
        self.cache.remove(game_id);
    }

    /// Queues a narrow patch for the persister. The returned receiver
    /// resolves once the row was written; callers on the hot path spawn a
    /// listener instead of awaiting it.
    pub fn queue_patch(
        &self,
        game_id: &str,
        patch: GamePatch,
    ) -> oneshot::Receiver<Result<(), ServerError>> {
        let (tx, rx) = oneshot::channel();
        let job = PersistJob::Patch {
            game_id: game_id.to_owned(),
            patch,
            reply: Some(tx),
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            if let PersistJob::Patch {
                reply: Some(reply), ..
            } = job
            {
                let _ = reply.send(Err(ServerError::StoreUnavailable));
            }
        }
        rx
    }

    /// Queues a patch and waits for it to land. Not for the hot path.
    pub async fn patch_now(&self, game_id: &str, patch: GamePatch) -> Result<(), ServerError> {
        self.queue_patch(game_id, patch)
            .await
            .unwrap_or(Err(ServerError::StoreUnavailable))
    }

    /// Waits until every durable write queued so far has been applied.
    pub async fn flush(&self) -> Result<(), ServerError> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(PersistJob::Flush { reply: tx })
            .map_err(|_| ServerError::StoreUnavailable)?;
        rx.await.map_err(|_| ServerError::StoreUnavailable)
    }

    /// Applies `patch` only if the row still matches `predicate`; returns
    /// whether a row was modified. Every terminal transition goes through
    /// here, which is what makes terminations exactly-once under
    /// concurrent attempts. Runs through the persister queue so it cannot
    /// overtake previously queued patches for the same game.
    pub async fn conditional_update(
        &self,
        game_id: &str,
        predicate: UpdatePredicate,
        patch: GamePatch,
    ) -> Result<bool, ServerError> {
        let (tx, rx) = oneshot::channel();
        let job = PersistJob::Conditional {
            game_id: game_id.to_owned(),
            predicate,
            patch: patch.clone(),
            reply: tx,
        };
        if self.jobs.send(job).is_err() {
            return Err(ServerError::StoreUnavailable);
        }
        let modified = rx.await.map_err(|_| ServerError::StoreUnavailable)??;

        if modified {
            if let Some(mut cached) = self.cache.get_mut(game_id) {
                patch.apply_to(&mut cached);
                cached.debug_check_invariants();
            }
            if patch.status == Some(GameStatus::Completed) {
                self.evict(game_id);
            }
        }
        Ok(modified)
    }

    /// Ids of all games the timeout watcher has to look at this tick.
    pub async fn ongoing_ids(&self) -> Result<Vec<GameId>, ServerError> {
        let rows = sqlx::query("select id from game where status = 'ongoing'")
            .fetch_all(&self.pool.0)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get::<String, _>("id")?);
        }
        Ok(ids)
    }
}

async fn run_persister(pool: Pool, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Patch {
                game_id,
                patch,
                reply,
            } => {
                let result = apply_patch(&pool, &game_id, &patch, None).await.map(|_| ());
                if let Err(error) = &result {
                    error!("persisting patch for game {game_id} failed: {error}");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            PersistJob::Conditional {
                game_id,
                predicate,
                patch,
                reply,
            } => {
                let result = apply_patch(&pool, &game_id, &patch, Some(&predicate))
                    .await
                    .map(|rows| rows > 0);
                if let Err(error) = &result {
                    error!("conditional update for game {game_id} failed: {error}");
                }
                let _ = reply.send(result);
            }
            PersistJob::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

fn json<T: serde::Serialize>(value: &T) -> Result<String, ServerError> {
    Ok(serde_json::to_string(value)?)
}

fn optional_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, ServerError> {
    value.as_ref().map(|v| json(v)).transpose()
}

async fn insert_game(pool: &Pool, game: &Game) -> Result<(), ServerError> {
    sqlx::query(
        r"insert into game (
            id, white_player, black_player, history, status, result,
            result_reason, clock, time_control, premove_white, premove_black,
            disconnected_player, disconnect_deadline_ms, stats_applied,
            pending_draw_offer_from, white_draw_offers, black_draw_offers,
            rematch_offer_from, rematch_declined, next_game_id, created_at_ms
        ) values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&game.id)
    .bind(&game.white_player.0)
    .bind(&game.black_player.0)
    .bind(json(&game.history)?)
    .bind(game.status.as_str())
    .bind(game.result.map(GameResult::as_str))
    .bind(game.result_reason.map(ResultReason::as_str))
    .bind(json(&game.clock)?)
    .bind(json(&game.time_control)?)
    .bind(optional_json(&game.premove_white)?)
    .bind(optional_json(&game.premove_black)?)
    .bind(game.disconnected_player.as_ref().map(|u| u.0.clone()))
    .bind(game.disconnect_deadline_ms)
    .bind(game.stats_applied)
    .bind(game.pending_draw_offer_from.map(PlayerColor::as_str))
    .bind(i64::from(game.white_draw_offers))
    .bind(i64::from(game.black_draw_offers))
    .bind(game.rematch_offer_from.map(PlayerColor::as_str))
    .bind(game.rematch_declined)
    .bind(&game.next_game_id)
    .bind(game.created_at_ms)
    .execute(&pool.0)
    .await?;
    Ok(())
}

async fn select_game(pool: &Pool, game_id: &str) -> Result<Option<Game>, ServerError> {
    let row = sqlx::query("select * from game where id = ?")
        .bind(game_id)
        .fetch_optional(&pool.0)
        .await?;
    row.map(game_from_row).transpose()
}

async fn apply_patch(
    pool: &Pool,
    game_id: &str,
    patch: &GamePatch,
    predicate: Option<&UpdatePredicate>,
) -> Result<u64, ServerError> {
    debug_assert!(!patch.is_empty(), "refusing to build an empty patch");

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("update game set ");
    let mut fields = qb.separated(", ");

    if let Some(history) = &patch.history {
        fields.push("history = ");
        fields.push_bind_unseparated(json(history)?);
    }
    if let Some(status) = patch.status {
        fields.push("status = ");
        fields.push_bind_unseparated(status.as_str());
    }
    if let Some(result) = patch.result {
        fields.push("result = ");
        fields.push_bind_unseparated(result.as_str());
    }
    if let Some(reason) = patch.result_reason {
        fields.push("result_reason = ");
        fields.push_bind_unseparated(reason.as_str());
    }
    if let Some(clock) = &patch.clock {
        fields.push("clock = ");
        fields.push_bind_unseparated(json(clock)?);
    }
    if let Some(slot) = &patch.premove_white {
        fields.push("premove_white = ");
        fields.push_bind_unseparated(optional_json(slot)?);
    }
    if let Some(slot) = &patch.premove_black {
        fields.push("premove_black = ");
        fields.push_bind_unseparated(optional_json(slot)?);
    }
    if let Some(disconnect) = &patch.disconnect {
        let (user, deadline) = match disconnect {
            Some((user, deadline)) => (Some(user.0.clone()), Some(*deadline)),
            None => (None, None),
        };
        fields.push("disconnected_player = ");
        fields.push_bind_unseparated(user);
        fields.push("disconnect_deadline_ms = ");
        fields.push_bind_unseparated(deadline);
    }
    if let Some(stats_applied) = patch.stats_applied {
        fields.push("stats_applied = ");
        fields.push_bind_unseparated(stats_applied);
    }
    if let Some(offer) = patch.pending_draw_offer_from {
        fields.push("pending_draw_offer_from = ");
        fields.push_bind_unseparated(offer.map(PlayerColor::as_str));
    }
    if let Some(count) = patch.white_draw_offers {
        fields.push("white_draw_offers = ");
        fields.push_bind_unseparated(i64::from(count));
    }
    if let Some(count) = patch.black_draw_offers {
        fields.push("black_draw_offers = ");
        fields.push_bind_unseparated(i64::from(count));
    }
    if let Some(offer) = patch.rematch_offer_from {
        fields.push("rematch_offer_from = ");
        fields.push_bind_unseparated(offer.map(PlayerColor::as_str));
    }
    if let Some(declined) = patch.rematch_declined {
        fields.push("rematch_declined = ");
        fields.push_bind_unseparated(declined);
    }
    if let Some(next) = &patch.next_game_id {
        fields.push("next_game_id = ");
        fields.push_bind_unseparated(next.clone());
    }

    qb.push(" where id = ");
    qb.push_bind(game_id.to_owned());

    if let Some(predicate) = predicate {
        qb.push(" and status = ");
        qb.push_bind(predicate.status.as_str());
        match &predicate.disconnected_player {
            Some(Some(user)) => {
                qb.push(" and disconnected_player = ");
                qb.push_bind(user.0.clone());
            }
            Some(None) => {
                qb.push(" and disconnected_player is null");
            }
            None => {}
        }
    }

    let result = qb.build().execute(&pool.0).await?;
    Ok(result.rows_affected())
}

fn parse_with<T>(
    value: Option<String>,
    parse: impl Fn(&str) -> Option<T>,
    what: &str,
) -> Result<Option<T>, ServerError> {
    match value {
        None => Ok(None),
        Some(text) => parse(&text)
            .map(Some)
            .ok_or_else(|| ServerError::CorruptGame(format!("unreadable {what}: {text}"))),
    }
}

fn game_from_row(row: SqliteRow) -> Result<Game, ServerError> {
    let status: String = row.try_get("status")?;
    let status = GameStatus::parse(&status)
        .ok_or_else(|| ServerError::CorruptGame(format!("unreadable status: {status}")))?;

    let history: String = row.try_get("history")?;
    let clock: String = row.try_get("clock")?;
    let time_control: String = row.try_get("time_control")?;

    let premove_white: Option<String> = row.try_get("premove_white")?;
    let premove_black: Option<String> = row.try_get("premove_black")?;

    Ok(Game {
        id: row.try_get("id")?,
        white_player: UserId(row.try_get("white_player")?),
        black_player: UserId(row.try_get("black_player")?),
        history: serde_json::from_str(&history)?,
        status,
        result: parse_with(row.try_get("result")?, GameResult::parse, "result")?,
        result_reason: parse_with(
            row.try_get("result_reason")?,
            ResultReason::parse,
            "result reason",
        )?,
        clock: serde_json::from_str::<ClockSnapshot>(&clock)?,
        time_control: serde_json::from_str::<TimeControl>(&time_control)?,
        premove_white: premove_white
            .map(|text| serde_json::from_str::<QueuedPremove>(&text))
            .transpose()?,
        premove_black: premove_black
            .map(|text| serde_json::from_str::<QueuedPremove>(&text))
            .transpose()?,
        disconnected_player: row
            .try_get::<Option<String>, _>("disconnected_player")?
            .map(UserId),
        disconnect_deadline_ms: row.try_get("disconnect_deadline_ms")?,
        stats_applied: row.try_get("stats_applied")?,
        pending_draw_offer_from: parse_with(
            row.try_get("pending_draw_offer_from")?,
            PlayerColor::parse,
            "draw offer color",
        )?,
        white_draw_offers: row.try_get::<i64, _>("white_draw_offers")? as u8,
        black_draw_offers: row.try_get::<i64, _>("black_draw_offers")? as u8,
        rematch_offer_from: parse_with(
            row.try_get("rematch_offer_from")?,
            PlayerColor::parse,
            "rematch offer color",
        )?,
        rematch_declined: row.try_get("rematch_declined")?,
        next_game_id: row.try_get("next_game_id")?,
        created_at_ms: row.try_get("created_at_ms")?,
    })
}
