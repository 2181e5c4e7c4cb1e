//! WebSocket upgrade handler.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::auth::middleware::AuthUser;
use crate::AppState;

use super::channel::DEFAULT_CHANNEL;
use super::client::{Client, ClientOptions};
use super::conn::WsConnection;

pub fn router() -> Router<AppState> {
    Router::new().route("/wss/default.io", get(ws_upgrade))
}

/// Authentication happens in the extractor, so unauthenticated requests are
/// rejected with 401 before any gateway state is touched.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    auth: AuthUser,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, auth.user_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, uid: i64) {
    let conn = Arc::new(WsConnection::new(socket));
    let channel = state.hub.register_channel(DEFAULT_CHANNEL);
    let options = ClientOptions {
        uid,
        buffer: state.config.socket.client_buffer,
    };

    let client = Client::connect(&state.hub, conn, channel, options, state.handler.clone()).await;
    client.wait().await;
    tracing::debug!(cid = client.cid(), uid, "connection task finished");
}
