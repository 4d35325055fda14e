//! This enum holds all errors that can be surfaced by the server. Over the
//! websocket they are translated into `error{message}` replies (or a
//! dedicated event where the client needs to distinguish); over the API
//! they map to status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("game not found")]
    GameNotFound,
    #[error("you are not a player in this game")]
    NotAPlayer,
    #[error("game is already over")]
    GameAlreadyOver,
    #[error("game is still in progress")]
    GameStillOngoing,
    #[error("not your turn")]
    NotYourTurn,
    #[error("illegal move: {0}")]
    IllegalMove(String),
    #[error("invalid premove: {0}")]
    InvalidPremove(String),
    #[error("you are on the move, play a normal move instead")]
    PremoveOnYourTurn,
    #[error("a draw offer is already pending")]
    DrawOfferPending,
    #[error("no draw offer is pending")]
    NoDrawOffer,
    #[error("draw offer limit reached")]
    DrawOfferLimit,
    #[error("rematch is not available")]
    RematchUnavailable,
    #[error("cancelling is only possible before the second move")]
    TooLateToCancel,
    #[error("corrupt game state: {0}")]
    CorruptGame(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not allowed")]
    NotAllowed,
    #[error("persistence writer is gone")]
    StoreUnavailable,
}

impl From<crate::rules::CorruptHistory> for ServerError {
    fn from(error: crate::rules::CorruptHistory) -> Self {
        ServerError::CorruptGame(error.to_string())
    }
}

impl ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Database(_)
            | ServerError::Serialization(_)
            | ServerError::CorruptGame(_)
            | ServerError::StoreUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::GameNotFound => StatusCode::NOT_FOUND,
            ServerError::NotAllowed | ServerError::NotAPlayer => StatusCode::FORBIDDEN,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// True for failures that are the server's fault rather than a bad
    /// request; only these are logged as errors.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ServerError::Database(_)
                | ServerError::Serialization(_)
                | ServerError::CorruptGame(_)
                | ServerError::StoreUnavailable
        )
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if self.is_internal() {
            error!("request failed: {self}");
        }
        (self.status_code(), self.to_string()).into_response()
    }
}
