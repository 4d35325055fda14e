//! End-to-end scenarios for the lifecycle engine: premove execution on
//! turn-flip, termination exactly-once, disconnect grace races, draw
//! offers, and rehydration.

use super::*;

use crate::clock;
use crate::db::game::{GamePatch, UpdatePredicate};
use crate::error::ServerError;
use crate::events::ServerEvent;
use crate::game::{GameResult, GameStatus, PlayerColor, ResultReason, UserId};
use crate::premove::ClearReason;
use crate::watcher;

/// White to move, Black has queued d7d5. White plays e2e4 and the premove
/// executes in the same critical section, in the documented emission order.
#[tokio::test]
async fn same_tick_premove_executes_in_order() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    let (black_socket, mut black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    h.coordinator
        .set_premove(black_socket, &bob(), premove_payload("g1", "d7", "d5"))
        .await
        .unwrap();
    drain(&mut white_rx);
    drain(&mut black_rx);

    h.play(white_socket, &alice(), "g1", "e2", "e4").await;

    let events = drain(&mut white_rx);
    assert_eq!(
        names(&events),
        vec![
            "move_made",
            "clock_update",
            "move_made",
            "clock_update",
            "premove_cleared",
        ]
    );
    match (&events[0], &events[2], &events[4]) {
        (
            ServerEvent::MoveMade { by: first_by, mv: first, .. },
            ServerEvent::MoveMade { by: second_by, mv: second, .. },
            ServerEvent::PremoveCleared { by, reason, .. },
        ) => {
            assert_eq!((*first_by, first.as_str()), (PlayerColor::White, "e2e4"));
            assert_eq!((*second_by, second.as_str()), (PlayerColor::Black, "d7d5"));
            assert_eq!(*by, PlayerColor::Black);
            assert_eq!(*reason, ClearReason::Executed);
        }
        _ => panic!("unexpected event shapes"),
    }

    // Both slots are empty again, in memory and durably.
    assert!(h.premoves.is_empty("g1"));
    h.flush_persistence().await;
    let durable = h.load_durable("g1").await;
    assert_eq!(durable.history, vec!["e2e4".to_owned(), "d7d5".to_owned()]);
    assert_eq!(durable.premove_black, None);
}

/// The premove slot never cascades: after Black's premove executed, White's
/// reply does not fire a second queued move for Black.
#[tokio::test]
async fn premove_does_not_cascade() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    h.coordinator
        .set_premove(black_socket, &bob(), premove_payload("g1", "d7", "d5"))
        .await
        .unwrap();
    h.play(white_socket, &alice(), "g1", "e2", "e4").await;
    drain(&mut white_rx);

    // White moves again; Black has no premove anymore, so exactly one
    // move_made goes out.
    h.play(white_socket, &alice(), "g1", "g1", "f3").await;
    let events = drain(&mut white_rx);
    assert_eq!(names(&events), vec!["move_made", "clock_update"]);
    h.flush_persistence().await;
    assert_eq!(h.load_durable("g1").await.history.len(), 3);
}

/// Black queues a premove that White's move makes illegal. The slot is
/// cleared, the premover is told, and the history grows by exactly one.
#[tokio::test]
async fn illegal_premove_is_rejected_on_turn_flip() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    let (black_socket, mut black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    h.play(white_socket, &alice(), "g1", "e2", "e4").await;
    h.play(black_socket, &bob(), "g1", "d7", "d5").await;

    // Black plans to push the d-pawn on; White captures it first.
    h.coordinator
        .set_premove(black_socket, &bob(), premove_payload("g1", "d5", "d4"))
        .await
        .unwrap();
    drain(&mut white_rx);
    drain(&mut black_rx);

    h.play(white_socket, &alice(), "g1", "e4", "d5").await;

    let room_events = drain(&mut white_rx);
    assert_eq!(
        names(&room_events),
        vec!["move_made", "clock_update", "premove_cleared"]
    );
    match &room_events[2] {
        ServerEvent::PremoveCleared { reason, .. } => assert_eq!(*reason, ClearReason::Rejected),
        _ => panic!("expected premove_cleared"),
    }

    // The premover additionally hears the rejection on their user room.
    let black_events = drain(&mut black_rx);
    assert!(names(&black_events).contains(&"premove_rejected"));

    h.flush_persistence().await;
    let game = h.load_durable("g1").await;
    assert_eq!(game.history.len(), 3);
    assert_eq!(game.status, GameStatus::Ongoing);
    assert!(h.premoves.is_empty("g1"));
}

/// Black is out of time when White moves with Black's premove still queued.
/// The clock engine short-circuits to a timeout termination: one game_over,
/// one stats application, no premove execution.
#[tokio::test]
async fn flag_fall_with_queued_premove_terminates_once() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    h.play(white_socket, &alice(), "g1", "e2", "e4").await;
    h.play(black_socket, &bob(), "g1", "e7", "e5").await;

    // Black's flag is down; nobody has noticed yet.
    let mut game = h.store.load("g1").await.unwrap().unwrap();
    game.clock.black_ms = 0;
    h.store.commit(&game);

    h.coordinator
        .set_premove(black_socket, &bob(), premove_payload("g1", "b8", "c6"))
        .await
        .unwrap();
    drain(&mut white_rx);

    let result = h
        .coordinator
        .make_move(white_socket, &alice(), move_payload("g1", "g1", "f3"))
        .await;
    assert!(result.is_ok());

    let events = drain(&mut white_rx);
    assert_eq!(count_game_over(&events), 1);
    match events.last().unwrap() {
        ServerEvent::GameOver { result, reason, .. } => {
            assert_eq!(*result, GameResult::White);
            assert_eq!(*reason, ResultReason::Timeout);
        }
        _ => panic!("expected game_over last"),
    }
    assert_eq!(h.stats.applied(), 1);

    h.flush_persistence().await;
    let game = h.load_durable("g1").await;
    // The move that observed the flag was not committed.
    assert_eq!(game.history.len(), 2);
    assert_eq!(game.status, GameStatus::Completed);
    assert!(game.stats_applied);
    assert_eq!(game.premove_black, None);
    assert!(h.premoves.is_empty("g1"));
}

/// N concurrent terminators, one game_over. The conditional-update latch
/// decides; everyone else loses gracefully.
#[tokio::test]
async fn concurrent_terminators_yield_one_game_over() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (observer, mut observer_rx) = h.connect(&alice());
    h.join(observer, &alice(), "g1").await;
    drain(&mut observer_rx);

    let white = alice();
    let black = bob();
    let resign_white = h.coordinator.resign(&white, game_ref("g1"));
    let resign_black = h.coordinator.resign(&black, game_ref("g1"));
    let watcher_timeout = h.coordinator.terminate_from_watcher(
        "g1",
        GameResult::White,
        ResultReason::Timeout,
        None,
        false,
    );

    let (r1, r2, r3) = tokio::join!(resign_white, resign_black, watcher_timeout);
    let wins = [r1.is_ok(), r2.is_ok(), matches!(r3, Ok(true))]
        .iter()
        .filter(|won| **won)
        .count();
    assert_eq!(wins, 1);

    assert_eq!(count_game_over(&drain(&mut observer_rx)), 1);
    assert_eq!(h.stats.applied(), 1);

    h.flush_persistence().await;
    assert!(h.load_durable("g1").await.stats_applied);
}

/// Resigning twice: the second attempt is a no-op on the latch and is
/// reported as such.
#[tokio::test]
async fn termination_latch_is_a_no_op_once_completed() {
    let h = Harness::new().await;
    h.create_game("g1").await;

    h.coordinator.resign(&alice(), game_ref("g1")).await.unwrap();
    let second = h.coordinator.resign(&bob(), game_ref("g1")).await;
    assert!(matches!(second, Err(ServerError::GameAlreadyOver)));

    let game = h.load_durable("g1").await;
    assert_eq!(game.result, Some(GameResult::Black));
    assert_eq!(game.result_reason, Some(ResultReason::Resignation));
    assert_eq!(h.stats.applied(), 1);
}

/// A reconnecting player clears the disconnect marker through join_game
/// before the watcher's deadline fires; the later sweep finds nothing.
#[tokio::test]
async fn reconnect_clears_marker_before_deadline() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    let deadline = clock::now_ms() + 20_000;
    assert!(h
        .store
        .conditional_update(
            "g1",
            UpdatePredicate::ongoing_without_disconnect(),
            GamePatch {
                disconnect: Some(Some((bob(), deadline))),
                ..Default::default()
            },
        )
        .await
        .unwrap());
    drain(&mut white_rx);

    let (black_socket, mut black_rx) = h.connect(&bob());
    h.join(black_socket, &bob(), "g1").await;

    let white_events = drain(&mut white_rx);
    assert!(names(&white_events).contains(&"opponent_reconnected"));
    assert_eq!(count_game_over(&white_events), 0);

    // The joiner got a state snapshot without the marker.
    let black_events = drain(&mut black_rx);
    let state = black_events
        .iter()
        .find_map(|event| match event {
            ServerEvent::GameState(state) => Some(state),
            _ => None,
        })
        .expect("join must reply with game_state");
    assert_eq!(state.disconnected_player, None);
    assert_eq!(state.status, GameStatus::Ongoing);

    // A sweep after the fact terminates nothing.
    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();
    assert_eq!(h.load_durable("g1").await.status, GameStatus::Ongoing);
}

/// The marker outlived its deadline but the player is actually back in the
/// room: the watcher's safety net reconnects instead of forfeiting.
#[tokio::test]
async fn watcher_safety_net_prefers_reconnect() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    assert!(h
        .store
        .conditional_update(
            "g1",
            UpdatePredicate::ongoing_without_disconnect(),
            GamePatch {
                disconnect: Some(Some((bob(), clock::now_ms() - 1_000))),
                ..Default::default()
            },
        )
        .await
        .unwrap());

    // Bob is present in the room, but the marker never got cleared.
    let (black_socket, _black_rx) = h.connect(&bob());
    h.fabric.join_game_room(black_socket, "g1");
    drain(&mut white_rx);

    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();

    let events = drain(&mut white_rx);
    assert!(names(&events).contains(&"opponent_reconnected"));
    assert_eq!(count_game_over(&events), 0);
    let game = h.load_durable("g1").await;
    assert_eq!(game.status, GameStatus::Ongoing);
    assert_eq!(game.disconnected_player, None);
}

/// Nobody came back: the watcher forfeits the game for the disconnected
/// side, exactly once, and a later join sees the completed state.
#[tokio::test]
async fn disconnect_timeout_forfeits_absent_player() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    assert!(h
        .store
        .conditional_update(
            "g1",
            UpdatePredicate::ongoing_without_disconnect(),
            GamePatch {
                disconnect: Some(Some((bob(), clock::now_ms() - 1_000))),
                ..Default::default()
            },
        )
        .await
        .unwrap());
    drain(&mut white_rx);

    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();
    // A second sweep must not terminate again.
    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();

    let events = drain(&mut white_rx);
    assert_eq!(count_game_over(&events), 1);
    match events.iter().find(|e| matches!(e, ServerEvent::GameOver { .. })) {
        Some(ServerEvent::GameOver { result, reason, .. }) => {
            assert_eq!(*result, GameResult::White);
            assert_eq!(*reason, ResultReason::DisconnectTimeout);
        }
        _ => unreachable!(),
    }
    assert_eq!(h.stats.applied(), 1);

    // The late reconnect reads the final state instead of racing anything.
    let (black_socket, mut black_rx) = h.connect(&bob());
    h.join(black_socket, &bob(), "g1").await;
    let state = drain(&mut black_rx)
        .into_iter()
        .find_map(|event| match event {
            ServerEvent::GameState(state) => Some(state),
            _ => None,
        })
        .expect("join must reply with game_state");
    assert_eq!(state.status, GameStatus::Completed);
    assert_eq!(state.result, Some(GameResult::White));
}

/// A freshly created game that nobody moves in gets aborted, and aborted
/// games never count towards stats.
#[tokio::test]
async fn first_move_timeout_aborts_without_stats() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;
    drain(&mut white_rx);

    // Not due yet: the sweep leaves the game alone.
    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();
    assert_eq!(h.load_durable("g1").await.status, GameStatus::Ongoing);

    let mut game = h.store.load("g1").await.unwrap().unwrap();
    game.clock.first_move_deadline_ms = Some(clock::now_ms() - 1);
    h.store.commit(&game);

    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();

    let events = drain(&mut white_rx);
    assert_eq!(count_game_over(&events), 1);
    match events.last().unwrap() {
        ServerEvent::GameOver { result, reason, .. } => {
            assert_eq!(*result, GameResult::Aborted);
            assert_eq!(*reason, ResultReason::CancelledDueToFirstMoveTimeout);
        }
        _ => panic!("expected game_over"),
    }

    assert_eq!(h.stats.applied(), 0);
    h.flush_persistence().await;
    assert!(!h.load_durable("g1").await.stats_applied);
}

/// Once White has moved, the first-move deadline is gone and the watcher
/// has nothing to abort.
#[tokio::test]
async fn first_move_deadline_only_fires_before_the_first_move() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, _white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    h.play(white_socket, &alice(), "g1", "e2", "e4").await;

    let game = h.store.load("g1").await.unwrap().unwrap();
    assert_eq!(game.clock.first_move_deadline_ms, None);

    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();
    assert_eq!(h.load_durable("g1").await.status, GameStatus::Ongoing);
}

/// A user with two tabs offers a draw: both tabs and the opponent hear it
/// exactly once each, the counter moves once, and a second offer is
/// rejected while the first is pending.
#[tokio::test]
async fn multi_tab_draw_offer() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (tab_a, mut tab_a_rx) = h.connect(&alice());
    let (tab_b, mut tab_b_rx) = h.connect(&alice());
    let (black_socket, mut black_rx) = h.connect(&bob());
    h.join(tab_a, &alice(), "g1").await;
    h.join(tab_b, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;
    drain(&mut tab_a_rx);
    drain(&mut tab_b_rx);
    drain(&mut black_rx);

    h.coordinator
        .offer_draw(tab_a, &alice(), game_ref("g1"))
        .await
        .unwrap();

    for rx in [&mut tab_a_rx, &mut tab_b_rx, &mut black_rx] {
        let events = drain(rx);
        let offered = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::DrawOffered { .. }))
            .count();
        assert_eq!(offered, 1);
    }

    h.flush_persistence().await;
    let game = h.load_durable("g1").await;
    assert_eq!(game.white_draw_offers, 1);
    assert_eq!(game.pending_draw_offer_from, Some(PlayerColor::White));

    let second = h.coordinator.offer_draw(tab_b, &alice(), game_ref("g1")).await;
    assert!(matches!(second, Err(ServerError::DrawOfferPending)));
}

#[tokio::test]
async fn draw_accept_ends_the_game_as_agreed() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    // Accepting without an offer fails.
    let premature = h.coordinator.accept_draw(&bob(), game_ref("g1")).await;
    assert!(matches!(premature, Err(ServerError::NoDrawOffer)));

    h.coordinator
        .offer_draw(white_socket, &alice(), game_ref("g1"))
        .await
        .unwrap();
    // The offerer cannot accept their own offer.
    let own = h.coordinator.accept_draw(&alice(), game_ref("g1")).await;
    assert!(matches!(own, Err(ServerError::NoDrawOffer)));
    drain(&mut white_rx);

    h.coordinator.accept_draw(&bob(), game_ref("g1")).await.unwrap();

    let events = drain(&mut white_rx);
    assert_eq!(count_game_over(&events), 1);
    let game = h.load_durable("g1").await;
    assert_eq!(game.result, Some(GameResult::Draw));
    assert_eq!(game.result_reason, Some(ResultReason::DrawAgreed));
    assert_eq!(h.stats.applied(), 1);
}

#[tokio::test]
async fn draw_offers_are_capped_per_player() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, _white_rx) = h.connect(&alice());
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    for _ in 0..2 {
        h.coordinator
            .offer_draw(white_socket, &alice(), game_ref("g1"))
            .await
            .unwrap();
        h.coordinator
            .reject_draw(black_socket, &bob(), game_ref("g1"))
            .await
            .unwrap();
    }

    let third = h
        .coordinator
        .offer_draw(white_socket, &alice(), game_ref("g1"))
        .await;
    assert!(matches!(third, Err(ServerError::DrawOfferLimit)));

    // The opponent's own budget is untouched.
    h.coordinator
        .offer_draw(black_socket, &bob(), game_ref("g1"))
        .await
        .unwrap();
}

/// set_premove then cancel_premove returns the slot to empty both in memory
/// and in durable state.
#[tokio::test]
async fn premove_set_then_cancel_round_trip() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(black_socket, &bob(), "g1").await;

    h.coordinator
        .set_premove(black_socket, &bob(), premove_payload("g1", "d7", "d5"))
        .await
        .unwrap();
    h.flush_persistence().await;
    assert!(h.load_durable("g1").await.premove_black.is_some());
    assert!(h.premoves.get("g1", PlayerColor::Black).is_some());

    h.coordinator
        .cancel_premove(black_socket, &bob(), game_ref("g1"))
        .await
        .unwrap();
    h.flush_persistence().await;
    assert_eq!(h.load_durable("g1").await.premove_black, None);
    assert!(h.premoves.is_empty("g1"));

    // Cancelling an empty slot is a quiet no-op.
    h.coordinator
        .cancel_premove(black_socket, &bob(), game_ref("g1"))
        .await
        .unwrap();
}

/// Premoving on your own turn is refused; so is a malformed premove shape.
#[tokio::test]
async fn premove_preconditions() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, _white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    let own_turn = h
        .coordinator
        .set_premove(white_socket, &alice(), premove_payload("g1", "e2", "e4"))
        .await;
    assert!(matches!(own_turn, Err(ServerError::PremoveOnYourTurn)));

    let bad_shape = h
        .coordinator
        .set_premove(white_socket, &alice(), premove_payload("g1", "e2", "e2"))
        .await;
    assert!(matches!(bad_shape, Err(ServerError::InvalidPremove(_))));
}

/// After a simulated restart the queue is empty but the store still holds
/// the shadow copy; the first touch of the game rehydrates it and the
/// premove still fires on turn-flip.
#[tokio::test]
async fn premove_rehydrates_from_durable_state() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(black_socket, &bob(), "g1").await;

    h.coordinator
        .set_premove(black_socket, &bob(), premove_payload("g1", "d7", "d5"))
        .await
        .unwrap();
    h.flush_persistence().await;

    // Restart: the in-process copies are gone, the row remains.
    h.premoves.clear_all("g1", ClearReason::GameOver);
    h.store.evict("g1");

    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;
    assert_eq!(
        h.premoves.get("g1", PlayerColor::Black).map(|p| p.input),
        Some(mv("d7", "d5"))
    );

    drain(&mut white_rx);
    h.play(white_socket, &alice(), "g1", "e2", "e4").await;
    let events = drain(&mut white_rx);
    assert_eq!(
        names(&events),
        vec![
            "move_made",
            "clock_update",
            "move_made",
            "clock_update",
            "premove_cleared",
        ]
    );
}

/// cancel_game aborts only while fewer than two half-moves were played.
#[tokio::test]
async fn cancel_game_boundary() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, _white_rx) = h.connect(&alice());
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    h.play(white_socket, &alice(), "g1", "e2", "e4").await;
    h.play(black_socket, &bob(), "g1", "e7", "e5").await;

    let too_late = h.coordinator.cancel_early(&alice(), game_ref("g1")).await;
    assert!(matches!(too_late, Err(ServerError::TooLateToCancel)));

    h.create_game("g2").await;
    h.coordinator.cancel_early(&alice(), game_ref("g2")).await.unwrap();
    let game = h.load_durable("g2").await;
    assert_eq!(game.result, Some(GameResult::Aborted));
    assert_eq!(h.stats.applied(), 0);
}

/// Checkmate on the board terminates through the same latch as everything
/// else, with the move broadcast before game_over.
#[tokio::test]
async fn checkmate_ends_the_game() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;

    // Fool's mate.
    h.play(white_socket, &alice(), "g1", "f2", "f3").await;
    h.play(black_socket, &bob(), "g1", "e7", "e5").await;
    h.play(white_socket, &alice(), "g1", "g2", "g4").await;
    drain(&mut white_rx);
    h.play(black_socket, &bob(), "g1", "d8", "h4").await;

    let events = drain(&mut white_rx);
    assert_eq!(
        names(&events),
        vec!["move_made", "clock_update", "game_over"]
    );
    match events.last().unwrap() {
        ServerEvent::GameOver { result, reason, .. } => {
            assert_eq!(*result, GameResult::Black);
            assert_eq!(*reason, ResultReason::Checkmate);
        }
        _ => unreachable!(),
    }
    assert_eq!(h.stats.applied(), 1);

    let game = h.load_durable("g1").await;
    assert_eq!(game.status, GameStatus::Completed);
    assert_eq!(game.clock.active_color, None);
}

/// Basic request validation on the move path.
#[tokio::test]
async fn move_rejections() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, _white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    let missing = h
        .coordinator
        .make_move(white_socket, &alice(), move_payload("nope", "e2", "e4"))
        .await;
    assert!(matches!(missing, Err(ServerError::GameNotFound)));

    let stranger = h
        .coordinator
        .make_move(white_socket, &UserId("carol".to_owned()), move_payload("g1", "e2", "e4"))
        .await;
    assert!(matches!(stranger, Err(ServerError::NotAPlayer)));

    let wrong_turn = h
        .coordinator
        .make_move(white_socket, &bob(), move_payload("g1", "e7", "e5"))
        .await;
    assert!(matches!(wrong_turn, Err(ServerError::NotYourTurn)));

    let illegal = h
        .coordinator
        .make_move(white_socket, &alice(), move_payload("g1", "e2", "e5"))
        .await;
    assert!(matches!(illegal, Err(ServerError::IllegalMove(_))));
}

/// The rematch handshake: offer, accept with swapped colors, and the links
/// between the two games.
#[tokio::test]
async fn rematch_accept_creates_a_swapped_game() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    // No rematch while the game runs.
    let early = h.coordinator.offer_rematch(&alice(), game_ref("g1")).await;
    assert!(matches!(early, Err(ServerError::GameStillOngoing)));

    h.coordinator.resign(&bob(), game_ref("g1")).await.unwrap();
    h.coordinator.offer_rematch(&alice(), game_ref("g1")).await.unwrap();

    // The offerer cannot accept their own offer.
    let own = h.coordinator.accept_rematch(&alice(), game_ref("g1")).await;
    assert!(matches!(own, Err(ServerError::RematchUnavailable)));

    drain(&mut white_rx);
    let new_game_id = h
        .coordinator
        .accept_rematch(&bob(), game_ref("g1"))
        .await
        .unwrap();

    let events = drain(&mut white_rx);
    assert!(names(&events).contains(&"rematch_accepted"));

    let old = h.load_durable("g1").await;
    assert_eq!(old.next_game_id, Some(new_game_id.clone()));
    assert_eq!(old.rematch_offer_from, None);

    let new = h.store.load(&new_game_id).await.unwrap().unwrap();
    assert_eq!(new.white_player, bob());
    assert_eq!(new.black_player, alice());
    assert_eq!(new.status, GameStatus::Ongoing);
    assert_eq!(new.history.len(), 0);
    assert_eq!(new.clock.base_ms, old.clock.base_ms);

    // The old game cannot host a second rematch.
    let again = h.coordinator.offer_rematch(&alice(), game_ref("g1")).await;
    assert!(matches!(again, Err(ServerError::RematchUnavailable)));
}

#[tokio::test]
async fn rematch_reject_is_final() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;

    h.coordinator.resign(&bob(), game_ref("g1")).await.unwrap();
    h.coordinator.offer_rematch(&alice(), game_ref("g1")).await.unwrap();
    drain(&mut white_rx);

    h.coordinator.reject_rematch(&bob(), game_ref("g1")).await.unwrap();
    assert!(names(&drain(&mut white_rx)).contains(&"rematch_rejected"));

    let after = h.coordinator.offer_rematch(&alice(), game_ref("g1")).await;
    assert!(matches!(after, Err(ServerError::RematchUnavailable)));
}

/// Leaving a game as the last connection of a player arms the disconnect
/// grace; the opponent is told, and the watcher forfeits after the window.
#[tokio::test]
async fn leave_game_arms_the_disconnect_grace() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    let (black_socket, _black_rx) = h.connect(&bob());
    h.join(white_socket, &alice(), "g1").await;
    h.join(black_socket, &bob(), "g1").await;
    drain(&mut white_rx);

    h.coordinator
        .leave_game(black_socket, &bob(), game_ref("g1"))
        .await
        .unwrap();

    let events = drain(&mut white_rx);
    assert!(names(&events).contains(&"opponent_disconnected"));

    let game = h.store.load("g1").await.unwrap().unwrap();
    assert_eq!(game.disconnected_player, Some(bob()));
    assert!(game.disconnect_deadline_ms.is_some());

    // Fast-forward: the deadline passes with Bob still gone.
    h.store
        .conditional_update(
            "g1",
            UpdatePredicate::ongoing_with_disconnect(&bob()),
            GamePatch {
                disconnect: Some(Some((bob(), clock::now_ms() - 1))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();

    let game = h.load_durable("g1").await;
    assert_eq!(game.status, GameStatus::Completed);
    assert_eq!(game.result_reason, Some(ResultReason::DisconnectTimeout));
}

/// A second connection of the same player keeps the game alive: leaving
/// with one tab does not arm the grace timer.
#[tokio::test]
async fn second_tab_prevents_the_disconnect_marker() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (tab_a, _tab_a_rx) = h.connect(&bob());
    let (tab_b, _tab_b_rx) = h.connect(&bob());
    h.join(tab_a, &bob(), "g1").await;
    h.join(tab_b, &bob(), "g1").await;

    h.coordinator
        .leave_game(tab_a, &bob(), game_ref("g1"))
        .await
        .unwrap();

    let game = h.store.load("g1").await.unwrap().unwrap();
    assert_eq!(game.disconnected_player, None);
}

/// The watcher flags a game whose active player ran out of time.
#[tokio::test]
async fn watcher_detects_flag_fall() {
    let h = Harness::new().await;
    h.create_game("g1").await;
    let (white_socket, mut white_rx) = h.connect(&alice());
    h.join(white_socket, &alice(), "g1").await;
    h.play(white_socket, &alice(), "g1", "e2", "e4").await;

    // Black's clock is running and empty.
    let mut game = h.store.load("g1").await.unwrap().unwrap();
    game.clock.black_ms = 1;
    game.clock.last_move_at_ms = clock::now_ms() - 10_000;
    h.store.commit(&game);
    drain(&mut white_rx);

    watcher::sweep_game(&h.coordinator, "g1").await.unwrap();

    let events = drain(&mut white_rx);
    assert_eq!(names(&events), vec!["clock_update", "game_over"]);
    match &events[0] {
        ServerEvent::ClockUpdate { black_ms, .. } => assert_eq!(*black_ms, 0),
        _ => unreachable!(),
    }
    let game = h.load_durable("g1").await;
    assert_eq!(game.result, Some(GameResult::White));
    assert_eq!(game.result_reason, Some(ResultReason::Timeout));
}
