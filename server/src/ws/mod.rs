//! Websocket transport. Each connection is authenticated during the
//! handshake (before the upgrade), then split into a reader task that
//! decodes client events and hands them to the coordinator, and a writer
//! task that drains the fabric's per-socket queue onto the wire.
//!
//! Schema validation happens here at the edge: payloads that do not decode
//! are answered with an `error` event and never reach the coordinator.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::ServerError;
use crate::events::{ClientEvent, ServerEvent};
use crate::fabric::SocketId;
use crate::game::UserId;
use crate::AppState;

/// How many outbound events a single connection may have in flight before
/// we start dropping instead of blocking the emitter.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

#[derive(Deserialize)]
pub struct HandshakeQuery {
    token: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// Axum route handler for the websocket endpoint. Identity is resolved
/// while the request is still plain HTTP; a failed handshake is refused
/// without ever upgrading.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match authenticate(&state, &params).await {
        Ok(user) => user,
        Err(_) => {
            info!("refused a websocket handshake");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(state, socket, user))
}

async fn authenticate(state: &AppState, params: &HandshakeQuery) -> Result<UserId, ServerError> {
    if let Some(token) = &params.token {
        return state.verifier.verify_token(token).await;
    }
    // Legacy handshake: a bare user id, accepted only where configured.
    if let Some(user_id) = &params.user_id {
        if state.verifier.allows_legacy_user_id() && !user_id.is_empty() {
            return Ok(UserId(user_id.clone()));
        }
    }
    Err(ServerError::NotAllowed)
}

/// Registers the socket on the fabric and runs its reader until the
/// connection dies, then sweeps the games it was in for a disconnect.
async fn handle_socket(state: AppState, socket: WebSocket, user: UserId) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

    let id = state.fabric.register(user.clone(), tx);
    info!("websocket connected for user {user}");

    let writer = tokio::spawn(write(sender, rx));
    read(&state, receiver, id, &user).await;
    writer.abort();

    connection_closed(&state, id).await;
}

/// Decode loop for one connection: text frames become client events, which
/// go to the coordinator; anything that fails the schema gets an `error`
/// reply and goes no further.
async fn read(state: &AppState, mut receiver: SplitStream<WebSocket>, id: SocketId, user: &UserId) {
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(error) => {
                info!("websocket read for {user} ended: {error}");
                return;
            }
        };
        let Message::Text(text) = msg else {
            // Binary and control frames carry nothing for us.
            continue;
        };
        match ClientEvent::decode(&text) {
            Ok(event) => dispatch(state, id, user, event).await,
            Err(error) => {
                debug!("dropping malformed payload from {user}: {error}");
                state.fabric.send_to(
                    id,
                    ServerEvent::Error {
                        message: "malformed payload".to_owned(),
                    },
                );
            }
        }
    }
}

/// Drains the fabric's per-socket queue, serializing each event onto the
/// wire as a text frame.
async fn write(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<ServerEvent>) {
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(error) => {
                error!("could not encode a {} event: {error}", event.name());
                continue;
            }
        };
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }
}

async fn dispatch(state: &AppState, id: SocketId, user: &UserId, event: ClientEvent) {
    let coordinator = &state.coordinator;
    let result = match event {
        ClientEvent::JoinGame(payload) => coordinator.join_game(id, user, payload).await,
        ClientEvent::MakeMove(payload) => coordinator.make_move(id, user, payload).await,
        ClientEvent::SetPremove(payload) => coordinator.set_premove(id, user, payload).await,
        ClientEvent::CancelPremove(payload) => coordinator.cancel_premove(id, user, payload).await,
        ClientEvent::ResignGame(payload) => coordinator.resign(user, payload).await,
        ClientEvent::OfferDraw(payload) => coordinator.offer_draw(id, user, payload).await,
        ClientEvent::AcceptDraw(payload) => coordinator.accept_draw(user, payload).await,
        ClientEvent::RejectDraw(payload) => coordinator.reject_draw(id, user, payload).await,
        ClientEvent::CancelGame(payload) => coordinator.cancel_early(user, payload).await,
        ClientEvent::OfferRematch(payload) => coordinator.offer_rematch(user, payload).await,
        ClientEvent::AcceptRematch(payload) => {
            coordinator.accept_rematch(user, payload).await.map(|_| ())
        }
        ClientEvent::RejectRematch(payload) => coordinator.reject_rematch(user, payload).await,
        ClientEvent::LeaveGame(payload) => coordinator.leave_game(id, user, payload).await,
    };

    if let Err(error) = result {
        if error.is_internal() {
            error!("operation by {user} failed: {error}");
        } else {
            debug!("rejected an operation by {user}: {error}");
        }
        state.fabric.send_to(
            id,
            ServerEvent::Error {
                message: error.to_string(),
            },
        );
    }
}

/// Final sweep after a socket is gone: if this was the user's last
/// connection in a game room, ask the coordinator to arm the disconnect
/// grace timer for that game.
async fn connection_closed(state: &AppState, id: SocketId) {
    let Some((user, game_rooms)) = state.fabric.unregister(id) else {
        return;
    };
    for game_id in game_rooms {
        if let Err(error) = state
            .coordinator
            .handle_player_departure(&game_id, &user)
            .await
        {
            warn!("disconnect sweep for game {game_id} failed: {error}");
        }
    }
}
