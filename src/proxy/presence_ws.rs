//! Presence WebSocket endpoint.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use log::{debug, warn};
use serde::Deserialize;

use crate::broadcast::presence_topic;
use crate::presence::PresenceStatus;

use super::{ProxyState, close_with, codes, resolve_user};

/// Frames a presence client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Heartbeat {
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
        status: PresenceStatus,
    },
    Leave,
}

/// GET /presence/{project_id}
pub(crate) async fn presence_ws(
    State(state): State<ProxyState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let Some(user_id) = resolve_user(&state, &headers).await else {
            close_with(socket, codes::POLICY, "Unauthorized").await;
            return;
        };

        handle_presence(state, socket, project_id, user_id).await;
    })
}

async fn handle_presence(
    state: ProxyState,
    mut socket: WebSocket,
    project_id: String,
    user_id: String,
) {
    let mut subscription = state.broadcaster.subscribe(&presence_topic(&project_id));

    // Initial snapshot before any mutation this client might cause.
    if send_list(&state, &mut socket, &project_id).await.is_err() {
        return;
    }

    // The session the client last asserted; used for the implicit leave on
    // close.
    let mut last_session_id: Option<String> = None;

    loop {
        tokio::select! {
            notified = subscription.notified() => {
                if !notified {
                    break;
                }
                if send_list(&state, &mut socket, &project_id).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Heartbeat { session_id, status }) => {
                            last_session_id = session_id.clone();
                            state.presence.heartbeat(&project_id, &user_id, session_id, status);
                        }
                        Ok(ClientFrame::Leave) => {
                            state.presence.leave(&project_id, &user_id, last_session_id.clone());
                        }
                        Err(err) => {
                            debug!("unparseable presence frame from {}: {}", user_id, err);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("presence socket error for {}: {}", user_id, err);
                    break;
                }
            }
        }
    }

    // Whatever was last asserted is released when the socket goes away;
    // the subscription drop unsubscribes.
    state
        .presence
        .leave(&project_id, &user_id, last_session_id);
}

async fn send_list(
    state: &ProxyState,
    socket: &mut WebSocket,
    project_id: &str,
) -> Result<(), ()> {
    let entries = state.presence.list(project_id);
    let json = match serde_json::to_string(&entries) {
        Ok(json) => json,
        Err(err) => {
            warn!("serializing presence list failed: {}", err);
            return Err(());
        }
    };

    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
