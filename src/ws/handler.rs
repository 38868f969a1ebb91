//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{GameError, MatchEvent, MatchHandle};
use crate::http::middleware::verify_jwt;
use crate::util::rate_limit::PlayerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// JWT token for authentication
    pub token: String,
    /// Match this socket is bound to
    pub match_id: Uuid,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    // Verify JWT token before upgrading
    match verify_jwt(&query.token, &state.config.supabase_jwt_secret) {
        Ok(claims) => {
            info!(player_id = %claims.sub, match_id = %query.match_id, "WebSocket upgrade for authenticated player");
            ws.on_upgrade(move |socket| handle_socket(socket, claims, query.match_id, state))
        }
        Err(e) => {
            error!(error = %e, "WebSocket auth failed");
            Response::builder()
                .status(401)
                .body("Unauthorized".into())
                .unwrap_or_default()
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    claims: crate::http::middleware::JwtClaims,
    match_id: Uuid,
    state: AppState,
) {
    let player_id = claims.sub;
    let display_name = claims.display_name();
    info!(player_id = %player_id, match_id = %match_id, "New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Resolve (or recover) the engine for this match
    let handle = match state.registry.get_or_create(match_id).await {
        Ok(handle) => handle,
        Err(e) => {
            let _ = send_msg(
                &mut ws_sink,
                &ServerMsg::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    // Subscribe before the first snapshot so no committed transition can
    // slip between the two
    let mut events = handle.subscribe();

    let welcome = ServerMsg::Welcome {
        player_id,
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(player_id = %player_id, error = %e, "Failed to send welcome");
        return;
    }

    let mut last_version = 0u64;
    match handle.snapshot(Some(player_id)).await {
        Ok(snapshot) => {
            last_version = snapshot.version;
            if send_msg(&mut ws_sink, &ServerMsg::Snapshot { snapshot })
                .await
                .is_err()
            {
                return;
            }
        }
        Err(e) => {
            let _ = send_error(&mut ws_sink, &e).await;
            return;
        }
    }

    let rate_limiter = PlayerRateLimiter::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MatchEvent::Updated { version }) => {
                    if version <= last_version {
                        continue;
                    }
                    // Re-fetch a viewer-scoped snapshot: the broadcast
                    // carries no roles, so concealment cannot leak here.
                    match handle.snapshot(Some(player_id)).await {
                        Ok(snapshot) => {
                            last_version = snapshot.version;
                            if send_msg(&mut ws_sink, &ServerMsg::Snapshot { snapshot }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(player_id = %player_id, error = %e, "snapshot fetch failed");
                            break;
                        }
                    }
                }
                Ok(MatchEvent::Notice { text }) => {
                    if send_msg(&mut ws_sink, &ServerMsg::Notice { text }).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(player_id = %player_id, lagged = n, "event receiver lagged");
                    // resync on the next Updated event
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(player_id = %player_id, "match engine retired, closing socket");
                    break;
                }
            },

            maybe_msg = ws_stream.next() => match maybe_msg {
                Some(Ok(Message::Text(text))) => {
                    if !rate_limiter.check_command() {
                        warn!(player_id = %player_id, "Rate limited command message");
                        continue;
                    }

                    let client_msg = match serde_json::from_str::<ClientMsg>(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(player_id = %player_id, error = %e, "Failed to parse client message");
                            continue;
                        }
                    };

                    if let ClientMsg::Ping { t } = client_msg {
                        if send_msg(&mut ws_sink, &ServerMsg::Pong { t }).await.is_err() {
                            break;
                        }
                        continue;
                    }

                    match dispatch(&handle, player_id, &display_name, client_msg).await {
                        Ok(snapshot) => {
                            last_version = last_version.max(snapshot.version);
                            if send_msg(&mut ws_sink, &ServerMsg::Snapshot { snapshot }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            if send_error(&mut ws_sink, &e).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(player_id = %player_id, "Received binary message, ignoring");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    info!(player_id = %player_id, "Client initiated close");
                    break;
                }
                Some(Err(e)) => {
                    error!(player_id = %player_id, error = %e, "WebSocket error");
                    break;
                }
                None => break,
            },
        }
    }

    // A dropped connection is not a departure: the player may reconnect
    // and the match keeps running on its own clock.
    info!(player_id = %player_id, match_id = %match_id, "WebSocket connection closed");
}

/// Route a parsed client command to the engine
async fn dispatch(
    handle: &MatchHandle,
    player_id: Uuid,
    display_name: &str,
    msg: ClientMsg,
) -> Result<crate::game::MatchSnapshot, GameError> {
    match msg {
        ClientMsg::Join => handle.join(player_id, display_name.to_string()).await,
        ClientMsg::Start => handle.start(player_id).await,
        ClientMsg::CastVote { target_id, round } => {
            handle.cast_vote(player_id, target_id, round).await
        }
        ClientMsg::NightAction { target_id } => handle.night_action(player_id, target_id).await,
        ClientMsg::Leave => handle.leave(player_id).await,
        // answered before dispatch; fall back to a plain read
        ClientMsg::Ping { .. } => handle.snapshot(Some(player_id)).await,
    }
}

async fn send_error(
    sink: &mut SplitSink<WebSocket, Message>,
    err: &GameError,
) -> Result<(), String> {
    send_msg(
        sink,
        &ServerMsg::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        },
    )
    .await
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
