//! Terminal WebSocket bridging.
//!
//! Authenticates the client, resolves the backing container, connects
//! upstream (directly over the container network, or through an exec
//! tunnel when that network is unreachable) and bridges frames in both
//! directions. Client frames that arrive before the upstream is ready are
//! buffered and drained in order.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::session::{SessionStatus, container_name_for};

use super::tunnel::ExecTunnel;
use super::{ProxyState, close_with, codes, resolve_user};

/// Attempts before giving up on the upstream.
const CONNECT_ATTEMPTS: u32 = 10;

/// Spacing between attempts.
const CONNECT_SPACING: Duration = Duration::from_millis(500);

/// Open timeout for a single direct connect.
const DIRECT_OPEN_TIMEOUT: Duration = Duration::from_millis(1500);

/// Cap on the pre-connect client buffer.
const MAX_BUFFER_BYTES: usize = 1024 * 1024;

type UpstreamWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// GET /terminal/{session_id}
pub(crate) async fn terminal_ws(
    State(state): State<ProxyState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let protocols = requested_protocols(&headers);
    let ws = ws.protocols(protocols.clone());

    ws.on_upgrade(move |socket| async move {
        let Some(user_id) = resolve_user(&state, &headers).await else {
            close_with(socket, codes::POLICY, "Unauthorized").await;
            return;
        };

        if !session_accessible(&state, &session_id, &user_id).await {
            close_with(
                socket,
                codes::POLICY,
                "Session not found, not running, or access denied",
            )
            .await;
            return;
        }

        let container_name = container_name_for(&session_id);
        if let Err(err) = bridge_terminal(state, socket, &container_name, &protocols).await {
            warn!("terminal bridge for {} ended: {:#}", session_id, err);
        }
    })
}

/// Subprotocols requested by the client, defaulting to `tty`.
fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    let listed: Vec<String> = headers
        .get("sec-websocket-protocol")
        .and_then(|h| h.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if listed.is_empty() {
        vec!["tty".to_string()]
    } else {
        listed
    }
}

/// Session exists, is running, and is owned by the user or shared.
async fn session_accessible(state: &ProxyState, session_id: &str, user_id: &str) -> bool {
    let session = match state.sessions.get(session_id).await {
        Ok(Some(session)) => session,
        _ => return false,
    };

    if session.status != SessionStatus::Running {
        return false;
    }

    if session.owner_user_id == user_id {
        return true;
    }

    match &session.project_id {
        Some(project_id) => matches!(
            state.projects.get(project_id).await,
            Ok(Some(project)) if project.accessible_by(user_id)
        ),
        None => false,
    }
}

/// Buffer early client frames, connect upstream, drain, then bridge.
async fn bridge_terminal(
    state: ProxyState,
    mut client: WebSocket,
    container_name: &str,
    protocols: &[String],
) -> Result<()> {
    let mut connect = Box::pin(connect_upstream(
        &state.engine_binary,
        container_name,
        state.terminal_port,
        protocols,
    ));

    let mut buffered: VecDeque<TungsteniteMessage> = VecDeque::new();
    let mut buffered_bytes = 0usize;

    enum Phase {
        Connected(Box<UpstreamWs>),
        ConnectFailed,
        BufferOverflow,
        ClientGone,
    }

    let phase = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(upstream) => break Phase::Connected(Box::new(upstream)),
                Err(err) => {
                    warn!("upstream connect to {} failed: {:#}", container_name, err);
                    break Phase::ConnectFailed;
                }
            },
            incoming = client.recv() => match incoming {
                Some(Ok(AxumMessage::Close(_))) | Some(Err(_)) | None => {
                    break Phase::ClientGone;
                }
                Some(Ok(msg)) => {
                    if let Some(frame) = client_to_upstream(msg) {
                        buffered_bytes += frame_len(&frame);
                        if buffered_bytes > MAX_BUFFER_BYTES {
                            break Phase::BufferOverflow;
                        }
                        buffered.push_back(frame);
                    }
                }
            }
        }
    };
    drop(connect);

    let upstream = match phase {
        Phase::Connected(upstream) => *upstream,
        Phase::ConnectFailed => {
            close_with(client, codes::ERROR, "Could not connect to terminal").await;
            return Ok(());
        }
        Phase::BufferOverflow => {
            close_with(client, codes::SIZE, "Message Too Big").await;
            return Ok(());
        }
        Phase::ClientGone => {
            debug!("client left before upstream was ready");
            return Ok(());
        }
    };

    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    // FIFO drain before any post-connect frame goes up.
    while let Some(frame) = buffered.pop_front() {
        upstream_tx
            .send(frame)
            .await
            .context("draining pre-connect buffer")?;
    }

    let (mut client_tx, mut client_rx) = client.split();

    let client_to_server = async {
        while let Some(msg) = client_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(_) => break,
            };
            let is_close = matches!(msg, AxumMessage::Close(_));
            if let Some(frame) = client_to_upstream(msg)
                && upstream_tx.send(frame).await.is_err()
            {
                break;
            }
            if is_close {
                break;
            }
        }
    };

    let server_to_client = async {
        while let Some(msg) = upstream_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(_) => break,
            };
            let is_close = matches!(msg, TungsteniteMessage::Close(_));
            if let Some(frame) = upstream_to_client(msg)
                && client_tx.send(frame).await.is_err()
            {
                break;
            }
            if is_close {
                break;
            }
        }
    };

    // When either side closes or errors, the paired half is dropped and
    // its socket terminated.
    tokio::select! {
        _ = client_to_server => {}
        _ = server_to_client => {}
    }

    Ok(())
}

/// Connect to the terminal daemon of a container.
///
/// Attempt A opens a WebSocket straight onto the container network.
/// Attempt B arms a single-shot exec tunnel and connects over loopback.
pub async fn connect_upstream(
    engine_binary: &str,
    container_name: &str,
    port: u16,
    protocols: &[String],
) -> Result<UpstreamWs> {
    let direct_url = format!("ws://{container_name}:{port}/ws");

    for attempt in 1..=CONNECT_ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(CONNECT_SPACING).await;
        }

        match tokio::time::timeout(DIRECT_OPEN_TIMEOUT, open_ws(&direct_url, protocols)).await {
            Ok(Ok(socket)) => {
                debug!("direct upstream to {} on attempt {}", container_name, attempt);
                return Ok(socket);
            }
            Ok(Err(err)) => debug!("direct connect failed (attempt {}): {}", attempt, err),
            Err(_) => debug!("direct connect timed out (attempt {})", attempt),
        }

        match ExecTunnel::open(engine_binary, container_name, port).await {
            Ok(tunnel) => {
                let url = format!("ws://127.0.0.1:{}/ws", tunnel.port());
                match tokio::time::timeout(DIRECT_OPEN_TIMEOUT, open_ws(&url, protocols)).await {
                    Ok(Ok(socket)) => {
                        debug!("tunneled upstream to {} on attempt {}", container_name, attempt);
                        return Ok(socket);
                    }
                    Ok(Err(err)) => debug!("tunnel connect failed (attempt {}): {}", attempt, err),
                    Err(_) => debug!("tunnel connect timed out (attempt {})", attempt),
                }
            }
            Err(err) => debug!("tunnel setup failed (attempt {}): {:#}", attempt, err),
        }
    }

    bail!(
        "terminal daemon in {} unreachable after {} attempts",
        container_name,
        CONNECT_ATTEMPTS
    )
}

async fn open_ws(url: &str, protocols: &[String]) -> Result<UpstreamWs> {
    let mut request = url.into_client_request()?;
    if !protocols.is_empty() {
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            protocols.join(", ").parse().context("protocol header")?,
        );
    }

    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

fn frame_len(msg: &TungsteniteMessage) -> usize {
    match msg {
        TungsteniteMessage::Text(text) => text.len(),
        TungsteniteMessage::Binary(data) => data.len(),
        TungsteniteMessage::Ping(data) | TungsteniteMessage::Pong(data) => data.len(),
        _ => 0,
    }
}

fn client_to_upstream(msg: AxumMessage) -> Option<TungsteniteMessage> {
    Some(match msg {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(frame) => TungsteniteMessage::Close(frame.map(|f| {
            TungsteniteCloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().to_string().into(),
            }
        })),
    })
}

fn upstream_to_client(msg: TungsteniteMessage) -> Option<AxumMessage> {
    Some(match msg {
        TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
        TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
        TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
        TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
        // Propagate the upstream close code to the client when present.
        TungsteniteMessage::Close(frame) => AxumMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().to_string().into(),
        })),
        TungsteniteMessage::Frame(_) => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_protocol_is_tty() {
        let headers = HeaderMap::new();
        assert_eq!(requested_protocols(&headers), vec!["tty".to_string()]);
    }

    #[test]
    fn listed_protocols_are_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-protocol", "tty, binary".parse().unwrap());
        assert_eq!(
            requested_protocols(&headers),
            vec!["tty".to_string(), "binary".to_string()]
        );
    }

    #[test]
    fn frame_len_counts_payload() {
        assert_eq!(
            frame_len(&TungsteniteMessage::Text("abcd".to_string().into())),
            4
        );
        assert_eq!(
            frame_len(&TungsteniteMessage::Binary(vec![0u8; 16].into())),
            16
        );
    }
}
