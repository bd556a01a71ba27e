//! Native client support for the proxy's WebSocket endpoints.
//!
//! Reconnect, heartbeat and status derivation for frontends driving the
//! presence and session-list sockets. The last received list survives
//! disconnects; it is only replaced by the next list from a live socket,
//! never cleared in between.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::presence::PresenceStatus;

/// Interval between presence heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Reconnect back-off: exponential from 1 s, doubling to a 30 s cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; doubles afterwards.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Derives the client's presence status from its last user interaction.
#[derive(Debug, Clone)]
pub struct InteractionTracker {
    last_interaction: Instant,
}

impl Default for InteractionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InteractionTracker {
    pub fn new() -> Self {
        Self {
            last_interaction: Instant::now(),
        }
    }

    /// Record a user interaction (key press, pointer movement, scroll).
    pub fn touch(&mut self) {
        self.last_interaction = Instant::now();
    }

    /// Status to report in the next heartbeat.
    pub fn status(&self) -> PresenceStatus {
        let idle = Instant::now().duration_since(self.last_interaction);
        if idle < Duration::from_secs(30) {
            PresenceStatus::Active
        } else if idle < Duration::from_secs(120) {
            PresenceStatus::Viewing
        } else {
            PresenceStatus::Inactive
        }
    }
}

/// Shared handle to the last received list.
pub type ListHandle = Arc<Mutex<Option<serde_json::Value>>>;

/// Reconnecting subscriber for the `/presence` and `/sessions` endpoints.
pub struct SubscriptionClient {
    url: String,
    list: ListHandle,
}

impl SubscriptionClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            list: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle to the last list received. Stays populated across
    /// reconnects.
    pub fn list(&self) -> ListHandle {
        self.list.clone()
    }

    /// Drive the subscription until `shutdown` flips to true.
    ///
    /// Retry state is local to this call: a new `run` never inherits a
    /// previous invocation's timers, so switching subscriptions cannot
    /// resurrect a stale reconnect loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    debug!("subscribed to {}", self.url);
                    backoff.reset();
                    self.pump(socket, &mut shutdown).await;
                }
                Err(err) => {
                    debug!("connect to {} failed: {}", self.url, err);
                }
            }

            if *shutdown.borrow() {
                break;
            }

            // The last list is retained through the gap.
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn pump<S>(
        &self,
        mut socket: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                incoming = socket.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            // The first list after a reconnect atomically
                            // replaces whatever was shown during the gap.
                            Ok(value) => self.replace_list(value),
                            Err(err) => debug!("unparseable list payload: {}", err),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("subscription socket error: {}", err);
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    let _ = socket.close(None).await;
                    break;
                }
            }
        }
    }

    fn replace_list(&self, value: serde_json::Value) {
        let mut list = self.list.lock().expect("list lock poisoned");
        *list = Some(value);
    }

    /// Insert a row optimistically (e.g. a session the user just started).
    ///
    /// The entry shows up immediately and is superseded wholesale by the
    /// next list from the server. Rows with a matching `id` are not
    /// duplicated.
    pub fn insert_optimistic(&self, entry: serde_json::Value) {
        let mut list = self.list.lock().expect("list lock poisoned");
        let current = list.get_or_insert_with(|| serde_json::Value::Array(Vec::new()));

        if let Some(rows) = current.as_array_mut() {
            let id = entry.get("id").cloned();
            let exists = id
                .as_ref()
                .is_some_and(|id| rows.iter().any(|row| row.get("id") == Some(id)));
            if !exists {
                rows.insert(0, entry);
            }
        }
    }
}

/// Heartbeat loop for a presence socket.
///
/// Emits a heartbeat immediately on open and every 15 s thereafter, with
/// the status derived from the interaction tracker. On shutdown a `leave`
/// frame is sent best-effort before closing.
pub struct PresenceReporter {
    url: String,
    session_id: Option<String>,
    tracker: Arc<Mutex<InteractionTracker>>,
}

impl PresenceReporter {
    pub fn new(url: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            url: url.into(),
            session_id,
            tracker: Arc::new(Mutex::new(InteractionTracker::new())),
        }
    }

    /// Handle for interaction sources to touch.
    pub fn tracker(&self) -> Arc<Mutex<InteractionTracker>> {
        self.tracker.clone()
    }

    fn heartbeat_frame(&self) -> String {
        let status = self.tracker.lock().expect("tracker lock poisoned").status();
        json!({
            "type": "heartbeat",
            "sessionId": self.session_id,
            "status": status,
        })
        .to_string()
    }

    /// Drive the reporter until `shutdown` flips to true, reconnecting
    /// with back-off like the subscription client.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match connect_async(self.url.as_str()).await {
                Ok((mut socket, _)) => {
                    backoff.reset();

                    if socket
                        .send(Message::Text(self.heartbeat_frame().into()))
                        .await
                        .is_err()
                    {
                        continue;
                    }

                    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                    ticker.tick().await; // first tick is immediate; already sent

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if socket
                                    .send(Message::Text(self.heartbeat_frame().into()))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            incoming = socket.next() => match incoming {
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                            _ = shutdown.changed() => {
                                let leave = json!({"type": "leave"}).to_string();
                                if let Err(err) = socket.send(Message::Text(leave.into())).await {
                                    warn!("leave on shutdown failed: {}", err);
                                }
                                let _ = socket.close(None).await;
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!("presence connect to {} failed: {}", self.url, err);
                }
            }

            if *shutdown.borrow() {
                break;
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn backoff_resets_after_success() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn interaction_status_windows() {
        let mut tracker = InteractionTracker::new();
        assert_eq!(tracker.status(), PresenceStatus::Active);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(tracker.status(), PresenceStatus::Viewing);

        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(tracker.status(), PresenceStatus::Inactive);

        tracker.touch();
        assert_eq!(tracker.status(), PresenceStatus::Active);
    }

    #[test]
    fn list_is_replaced_not_cleared() {
        let client = SubscriptionClient::new("ws://localhost:1/sessions/p1");
        let handle = client.list();

        client.replace_list(json!([{"id": "s1"}]));
        assert!(handle.lock().unwrap().is_some());

        // A disconnect never clears; only the next message replaces.
        client.replace_list(json!([{"id": "s2"}]));
        let current = handle.lock().unwrap().clone().unwrap();
        assert_eq!(current[0]["id"], "s2");
    }

    #[test]
    fn optimistic_insert_deduplicates_and_yields_to_server() {
        let client = SubscriptionClient::new("ws://localhost:1/sessions/p1");
        let handle = client.list();

        client.insert_optimistic(json!({"id": "s1", "status": "starting"}));
        client.insert_optimistic(json!({"id": "s1", "status": "starting"}));
        assert_eq!(handle.lock().unwrap().clone().unwrap().as_array().unwrap().len(), 1);

        // The next server list replaces the optimistic state wholesale.
        client.replace_list(json!([{"id": "s1", "status": "running"}]));
        let current = handle.lock().unwrap().clone().unwrap();
        assert_eq!(current[0]["status"], "running");
    }

    #[test]
    fn heartbeat_frame_shape() {
        let reporter = PresenceReporter::new("ws://x", Some("s1".to_string()));
        let frame: serde_json::Value =
            serde_json::from_str(&reporter.heartbeat_frame()).unwrap();
        assert_eq!(frame["type"], "heartbeat");
        assert_eq!(frame["sessionId"], "s1");
        assert_eq!(frame["status"], "active");
    }
}
