//! WebSocket proxy integration tests.

use std::net::SocketAddr;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use open_commander::auth::{AuthConfig, AuthResolver};
use open_commander::broadcast::{BroadcasterRegistry, sessions_topic};
use open_commander::db::Database;
use open_commander::presence::PresenceTracker;
use open_commander::project::{Project, ProjectRepository};
use open_commander::proxy::{ProxyState, proxy_router};
use open_commander::session::{SessionRepository, SessionStatus, TerminalSession};
use open_commander::user::{User, UserRepository};

struct ProxyHarness {
    addr: SocketAddr,
    state: ProxyState,
    _db: Database,
}

fn disabled_auth() -> AuthConfig {
    AuthConfig {
        disabled: true,
        ..Default::default()
    }
}

fn cookie_auth() -> AuthConfig {
    AuthConfig {
        jwt_secret: Some("test-secret-for-proxy-tests-minimum-32-chars".to_string()),
        ..Default::default()
    }
}

async fn proxy_harness(auth_config: AuthConfig) -> ProxyHarness {
    let db = Database::in_memory().await.unwrap();
    let pool = db.pool().clone();

    let users = UserRepository::new(pool.clone());
    users
        .create(&User {
            id: "admin".to_string(),
            name: "Admin".to_string(),
            email: None,
            admin: true,
            created_at: Utc::now().to_rfc3339(),
        })
        .await
        .unwrap();

    let auth = AuthResolver::new(auth_config, users);

    let broadcaster = BroadcasterRegistry::new();
    let state = ProxyState {
        auth,
        sessions: SessionRepository::new(pool.clone()),
        projects: ProjectRepository::new(pool),
        presence: PresenceTracker::new(broadcaster.clone()),
        broadcaster,
        engine_binary: "docker".to_string(),
        terminal_port: 7681,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = proxy_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    ProxyHarness {
        addr,
        state,
        _db: db,
    }
}

async fn seed_shared_project(harness: &ProxyHarness, project_id: &str) {
    harness
        .state
        .projects
        .create(&Project {
            id: project_id.to_string(),
            name: "demo".to_string(),
            folder: "demo".to_string(),
            owner_user_id: "admin".to_string(),
            shared: true,
            default_agent_id: None,
            created_at: Utc::now().to_rfc3339(),
        })
        .await
        .unwrap();
}

async fn seed_session(harness: &ProxyHarness, id: &str, project_id: &str) {
    let now = Utc::now().to_rfc3339();
    harness
        .state
        .sessions
        .create(&TerminalSession {
            id: id.to_string(),
            name: format!("session {id}"),
            owner_user_id: "admin".to_string(),
            project_id: Some(project_id.to_string()),
            parent_id: None,
            relation_type: None,
            status: SessionStatus::Running,
            container_name: Some(format!("oc-sess-{id}")),
            created_at: now.clone(),
            updated_at: now,
        })
        .await
        .unwrap();
}

async fn next_text<S>(socket: &mut tokio_tungstenite::WebSocketStream<S>) -> Value
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match socket.next().await.expect("socket ended").expect("socket error") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Heartbeats mutate the table and fan out an updated list; leave clears it.
#[tokio::test]
async fn presence_heartbeat_and_leave_fan_out() {
    let harness = proxy_harness(disabled_auth()).await;

    let url = format!("ws://{}/presence/p1", harness.addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    // Initial snapshot is empty.
    let initial = next_text(&mut socket).await;
    assert_eq!(initial, json!([]));

    socket
        .send(Message::Text(
            json!({"type": "heartbeat", "sessionId": "s1", "status": "active"})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let updated = next_text(&mut socket).await;
    let entries = updated.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["userId"], "admin");
    assert_eq!(entries[0]["sessionId"], "s1");
    assert_eq!(entries[0]["status"], "active");

    socket
        .send(Message::Text(json!({"type": "leave"}).to_string().into()))
        .await
        .unwrap();

    let cleared = next_text(&mut socket).await;
    assert_eq!(cleared, json!([]));
}

/// Unauthenticated upgrades are closed with 1008.
#[tokio::test]
async fn unauthenticated_connection_closes_with_policy() {
    let harness = proxy_harness(AuthConfig::default()).await;

    let url = format!("ws://{}/sessions/p1", harness.addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    match socket.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert_eq!(frame.reason.as_str(), "Unauthorized");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

/// The session list is sent on connect and re-sent on every broadcast.
#[tokio::test]
async fn session_list_updates_on_notify() {
    let harness = proxy_harness(disabled_auth()).await;
    seed_shared_project(&harness, "p1").await;
    seed_session(&harness, "s1", "p1").await;

    let url = format!("ws://{}/sessions/p1", harness.addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    let initial = next_text(&mut socket).await;
    let sessions = initial.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], "s1");
    assert_eq!(sessions[0]["containerName"], "oc-sess-s1");
    // Timestamps revive from their ISO representation.
    let created_at = sessions[0]["createdAt"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(created_at).is_ok());

    seed_session(&harness, "s2", "p1").await;
    harness.state.broadcaster.notify(&sessions_topic("p1"));

    let updated = next_text(&mut socket).await;
    assert_eq!(updated.as_array().unwrap().len(), 2);
}

/// Unknown projects close with 1008 even for authenticated users.
#[tokio::test]
async fn unknown_project_closes_with_policy() {
    let harness = proxy_harness(disabled_auth()).await;

    let url = format!("ws://{}/sessions/ghost", harness.addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    match socket.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

/// A valid auth cookie on the upgrade request resolves the user.
#[tokio::test]
async fn cookie_authenticated_connection_is_accepted() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let harness = proxy_harness(cookie_auth()).await;
    let token = harness.state.auth.generate_token("admin").unwrap();

    let mut request = format!("ws://{}/presence/p1", harness.addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Cookie",
        format!("auth_token={token}").parse().unwrap(),
    );

    let (mut socket, _) = connect_async(request).await.unwrap();

    // An accepted connection starts with the presence snapshot, not a
    // close frame.
    let initial = next_text(&mut socket).await;
    assert_eq!(initial, json!([]));
}

/// A terminal upgrade for a non-running session is refused with 1008.
#[tokio::test]
async fn terminal_refuses_missing_session() {
    let harness = proxy_harness(disabled_auth()).await;

    let url = format!("ws://{}/terminal/ghost", harness.addr);
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();

    match socket.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert!(frame.reason.as_str().contains("Session not found"));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}
