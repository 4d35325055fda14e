//! The timeout watcher: a single background loop that scans ongoing games
//! for overdue deadlines — disconnect grace, first-move window, flag fall —
//! and commits the corresponding terminal transition. It never takes a game
//! lock; every termination goes through the store's conditional-update
//! latch, which makes racing the coordinator (or a reconnecting player)
//! safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock;
use crate::coordinator::Coordinator;
use crate::error::ServerError;
use crate::game::{GameResult, ResultReason};

pub const TICK: Duration = Duration::from_millis(100);

pub fn spawn(coordinator: Arc<Coordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("timeout watcher running at {:?} ticks", TICK);
        loop {
            interval.tick().await;
            if let Err(error) = tick(&coordinator).await {
                // Errors never stop the loop; the next tick retries.
                warn!("timeout watcher tick failed: {error}");
            }
        }
    })
}

async fn tick(coordinator: &Coordinator) -> Result<(), ServerError> {
    for game_id in coordinator.store().ongoing_ids().await? {
        if let Err(error) = sweep_game(coordinator, &game_id).await {
            warn!("timeout sweep of game {game_id} failed: {error}");
        }
    }
    Ok(())
}

/// Checks one game for an overdue deadline, most urgent first. Public so
/// the scenario tests can drive a sweep deterministically.
pub async fn sweep_game(coordinator: &Coordinator, game_id: &str) -> Result<(), ServerError> {
    let Some(game) = coordinator.store().load(game_id).await? else {
        return Ok(());
    };
    if !game.is_ongoing() {
        return Ok(());
    }
    let now = clock::now_ms();

    // a) Disconnect grace expired.
    if let (Some(user), Some(deadline)) = (&game.disconnected_player, game.disconnect_deadline_ms)
    {
        if deadline <= now {
            if coordinator.fabric().user_present_in_game(game_id, user) {
                // Safety net: the user is back but the marker never got
                // cleared. Reconnect them instead of forfeiting.
                coordinator
                    .clear_disconnect_after_reconnect(game_id, user)
                    .await?;
            } else {
                let winner = game
                    .color_of(user)
                    .ok_or_else(|| {
                        ServerError::CorruptGame(format!(
                            "disconnect marker names a non-player: {user}"
                        ))
                    })?
                    .other();
                coordinator
                    .terminate_from_watcher(
                        game_id,
                        GameResult::win_for(winner),
                        ResultReason::DisconnectTimeout,
                        Some(user),
                        false,
                    )
                    .await?;
            }
            return Ok(());
        }
    }

    // b) Nobody ever moved. Only fires while the clock has not started.
    if game.clock.active_color.is_none() {
        if let Some(deadline) = game.clock.first_move_deadline_ms {
            if now > deadline {
                coordinator
                    .terminate_from_watcher(
                        game_id,
                        GameResult::Aborted,
                        ResultReason::CancelledDueToFirstMoveTimeout,
                        None,
                        false,
                    )
                    .await?;
                return Ok(());
            }
        }
    }

    // c) Flag fall on the active side.
    if let Some(flagged) = clock::project(&game.clock, now).timed_out {
        coordinator
            .terminate_from_watcher(
                game_id,
                GameResult::win_for(flagged.other()),
                ResultReason::Timeout,
                None,
                true,
            )
            .await?;
    }
    Ok(())
}
