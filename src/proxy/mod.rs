//! WebSocket multiplexing proxy.
//!
//! Front-door endpoints for terminals, presence and session lists. Every
//! endpoint authenticates the upgrade request's cookies before exchanging
//! frames; failures close with the standard policy codes instead of
//! surfacing HTTP errors, because browsers can't read upgrade response
//! bodies.

mod presence_ws;
mod sessions_ws;
mod terminal;
mod tunnel;

pub use terminal::connect_upstream;
pub use tunnel::ExecTunnel;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use log::info;
use tokio::net::TcpListener;

use crate::auth::AuthResolver;
use crate::broadcast::BroadcasterRegistry;
use crate::presence::PresenceTracker;
use crate::project::ProjectRepository;
use crate::session::SessionRepository;

/// State shared by the proxy handlers.
#[derive(Clone)]
pub struct ProxyState {
    pub auth: AuthResolver,
    pub sessions: SessionRepository,
    pub projects: ProjectRepository,
    pub presence: PresenceTracker,
    pub broadcaster: BroadcasterRegistry,
    /// Container engine binary, needed to spawn exec tunnels.
    pub engine_binary: String,
    /// Port the in-container terminal daemon listens on.
    pub terminal_port: u16,
}

/// Build the proxy router.
pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route("/terminal/{session_id}", get(terminal::terminal_ws))
        .route("/presence/{project_id}", get(presence_ws::presence_ws))
        .route("/sessions/{project_id}", get(sessions_ws::sessions_ws))
        .with_state(state)
}

/// Serve the proxy on the given listener.
pub async fn serve(listener: TcpListener, state: ProxyState) -> anyhow::Result<()> {
    info!("proxy listening on {}", listener.local_addr()?);
    axum::serve(listener, proxy_router(state)).await?;
    Ok(())
}

/// Close a just-accepted socket with a policy code and reason.
pub(crate) async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Resolve the user behind an upgrade request's Cookie header.
pub(crate) async fn resolve_user(state: &ProxyState, headers: &HeaderMap) -> Option<String> {
    let cookie_header = headers
        .get(axum::http::header::COOKIE)
        .and_then(|h| h.to_str().ok());
    state.auth.resolve_user(cookie_header).await.ok()
}

/// Standard close codes used by the proxy.
pub(crate) mod codes {
    pub use axum::extract::ws::close_code::{ERROR, POLICY, SIZE};
}
