//! Game management API. This is the seam the external matchmaker (or a
//! private-room creator) uses; all actual gameplay flows over the
//! websocket.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::ServerError;
use crate::events::GameStatePayload;
use crate::game::{Game, TimeControl, UserId};
use crate::AppState;

/// Hangs the management routes onto `api_router`; `server::run` nests the
/// result under "/api".
pub fn add_to_router(api_router: Router<AppState>) -> Router<AppState> {
    api_router
        .route("/create_game", post(create_game))
        .route("/game/:key", get(get_game))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGameRequest {
    white_player: String,
    black_player: String,
    time_control: TimeControl,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateGameResponse {
    game_id: String,
}

async fn create_game(
    State(state): State<AppState>,
    Json(request): Json<CreateGameRequest>,
) -> Result<Json<CreateGameResponse>, ServerError> {
    if !request.time_control.is_legal() {
        return Err(ServerError::BadRequest(
            "time control out of bounds".to_owned(),
        ));
    }
    if request.white_player.is_empty()
        || request.black_player.is_empty()
        || request.white_player == request.black_player
    {
        return Err(ServerError::BadRequest(
            "a game needs two distinct players".to_owned(),
        ));
    }

    info!("creating a new game on matchmaker request");
    let game = Game::new(
        uuid::Uuid::new_v4().to_string(),
        UserId(request.white_player),
        UserId(request.black_player),
        request.time_control,
        clock::now_ms(),
    );
    state.store.create(&game).await?;

    info!("game created with id {}", game.id);
    Ok(Json(CreateGameResponse { game_id: game.id }))
}

/// Returns the current state of the given game, as a spectator sees it.
/// This is intended for history and replay reads.
async fn get_game(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<GameStatePayload>, ServerError> {
    let game = state
        .store
        .load(&key)
        .await?
        .ok_or(ServerError::GameNotFound)?;
    Ok(Json(GameStatePayload::for_viewer(
        &game,
        None,
        clock::now_ms(),
    )))
}
