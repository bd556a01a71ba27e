//! Session-list WebSocket endpoint.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use log::{debug, warn};

use crate::broadcast::sessions_topic;

use super::{ProxyState, close_with, codes, resolve_user};

/// GET /sessions/{project_id}
pub(crate) async fn sessions_ws(
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

        let project = match state.projects.get(&project_id).await {
            Ok(Some(project)) if project.accessible_by(&user_id) => project,
            Ok(_) => {
                close_with(socket, codes::POLICY, "Project not found or access denied").await;
                return;
            }
            Err(err) => {
                warn!("project lookup for {} failed: {:#}", project_id, err);
                close_with(socket, codes::ERROR, "Project lookup failed").await;
                return;
            }
        };

        // Non-shared projects only surface the caller's own sessions.
        let owner_filter = if project.shared { None } else { Some(user_id) };

        handle_sessions(state, socket, project_id, owner_filter).await;
    })
}

async fn handle_sessions(
    state: ProxyState,
    mut socket: WebSocket,
    project_id: String,
    owner_filter: Option<String>,
) {
    let mut subscription = state.broadcaster.subscribe(&sessions_topic(&project_id));

    if send_list(&state, &mut socket, &project_id, owner_filter.as_deref())
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            notified = subscription.notified() => {
                if !notified {
                    break;
                }
                if send_list(&state, &mut socket, &project_id, owner_filter.as_deref())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("sessions socket error: {}", err);
                    break;
                }
            }
        }
    }
}

async fn send_list(
    state: &ProxyState,
    socket: &mut WebSocket,
    project_id: &str,
    owner_filter: Option<&str>,
) -> Result<(), ()> {
    let sessions = match state
        .sessions
        .list_live_for_project(project_id, owner_filter)
        .await
    {
        Ok(sessions) => sessions,
        Err(err) => {
            warn!("listing sessions for {} failed: {:#}", project_id, err);
            return Err(());
        }
    };

    let json = match serde_json::to_string(&sessions) {
        Ok(json) => json,
        Err(err) => {
            warn!("serializing session list failed: {}", err);
            return Err(());
        }
    };

    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}
