//! WebSocket entry points for both protocol versions (spec.md §6).
//!
//! v1 (`/ws`) binds its game name from an inbound `startup` message and
//! replies with `actions/reregister_all`, matching
//! `original_source/registry.py::Registry.handle`'s `Startup` branch. v2
//! (`/v2/<game>` or `/v2?game=<game>`) binds at handshake time and gets
//! none of that - the name comes straight from the route.
//!
//! Grounded on the teacher's `websocket_handler`/`websocket` pair in
//! `relay-server/src/main.rs`: split the socket, run a read loop, hand
//! each decoded frame off to the shared state.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use gateway_core::connection::Connection;
use protocol::{self, GameMessage, GatewayMessage, ProtocolVersion};

use crate::connection::WsConnection;
use crate::AppState;

pub async fn v1_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_v1(socket, state))
}

#[derive(Debug, Deserialize)]
pub struct GameQuery {
    game: Option<String>,
}

pub async fn v2_path_handler(
    ws: WebSocketUpgrade,
    Path(game): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_v2(socket, state, game))
}

pub async fn v2_query_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<GameQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match query.game {
        Some(game) => ws.on_upgrade(move |socket| handle_v2(socket, state, game)).into_response(),
        None => (axum::http::StatusCode::BAD_REQUEST, "missing ?game=<name>").into_response(),
    }
}

async fn handle_v1(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    let conn: Arc<dyn Connection> = Arc::new(WsConnection::new(sender));

    let first = match receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return,
    };
    let game = match serde_json::from_str::<GameMessage>(&first) {
        Ok(GameMessage::Startup { game }) => game,
        Ok(other) => {
            warn!(command = other.command(), "expected startup as the first v1 message");
            conn.close(protocol::close_code::PROTOCOL_ERROR, "expected startup").await;
            return;
        }
        Err(err) => {
            warn!(%err, "malformed startup message");
            conn.close(protocol::close_code::PROTOCOL_ERROR, "malformed message").await;
            return;
        }
    };

    let rules = state.config.rules_for(&game);
    let handle = match state
        .registry
        .connect(&game, ProtocolVersion::V1, Arc::clone(&conn), rules)
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            warn!(game = %game, %err, "rejecting connection");
            conn.close(protocol::close_code::PROTOCOL_ERROR, &err.to_string()).await;
            return;
        }
    };
    info!(game = %game, "v1 connection established");

    if conn.send(&GatewayMessage::ReregisterAll).await.is_err() {
        state.registry.disconnect(&game).await;
        return;
    }

    read_loop(&mut receiver, &state, &handle, &conn, &game).await;
    state.registry.disconnect(&game).await;
    info!(game = %game, "v1 connection closed");
}

async fn handle_v2(socket: WebSocket, state: Arc<AppState>, game: String) {
    let (sender, mut receiver) = socket.split();
    let conn: Arc<dyn Connection> = Arc::new(WsConnection::new(sender));

    let rules = state.config.rules_for(&game);
    let handle = match state
        .registry
        .connect(&game, ProtocolVersion::V2, Arc::clone(&conn), rules)
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            warn!(game = %game, %err, "rejecting connection");
            conn.close(protocol::close_code::PROTOCOL_ERROR, &err.to_string()).await;
            return;
        }
    };
    info!(game = %game, "v2 connection established");

    read_loop(&mut receiver, &state, &handle, &conn, &game).await;
    state.registry.disconnect(&game).await;
    info!(game = %game, "v2 connection closed");
}

async fn read_loop(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &Arc<AppState>,
    handle: &gateway_core::GameHandle,
    conn: &Arc<dyn Connection>,
    game: &str,
) {
    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(game, %err, "websocket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<GameMessage>(&text) {
                Ok(msg) => state.registry.dispatch(handle, msg),
                Err(err) => {
                    warn!(game, %err, "malformed message, closing");
                    conn.close(protocol::close_code::PROTOCOL_ERROR, "malformed message").await;
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
}
