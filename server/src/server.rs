//! Wires the axum router: the websocket endpoint plus the small management
//! API, all sharing one `AppState`.

use axum::{routing::get, Router};

use crate::{api, ws, AppState};

pub async fn run(state: AppState) {
    let api: Router<AppState> = api::add_to_router(Router::new());

    let app: Router = Router::new()
        .route("/websocket", get(ws::websocket_handler))
        .nest("/api", api)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.bind)
        .await
        .expect("could not bind the configured address");
    info!("listening on {}", state.config.bind);
    axum::serve(listener, app.into_make_service())
        .await
        .expect("server loop failed");
}
