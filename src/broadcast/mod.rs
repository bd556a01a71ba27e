//! In-process pub/sub keyed by topic string.
//!
//! Topics are opaque; the system uses `presence:<projectId>` and
//! `sessions:<projectId>`. Subscribers receive coalesced wakeups through a
//! bounded channel, so a `notify` issued right after `subscribe` is never
//! lost: either the signal lands in the channel or a previous signal is
//! still pending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

/// Per-subscriber wakeup buffer. Depth beyond one only matters when a
/// subscriber is slow; signals carry no payload and coalesce.
const WAKEUP_BUFFER_SIZE: usize = 8;

/// Format the presence topic for a project.
pub fn presence_topic(project_id: &str) -> String {
    format!("presence:{project_id}")
}

/// Format the session-list topic for a project.
pub fn sessions_topic(project_id: &str) -> String {
    format!("sessions:{project_id}")
}

struct Observer {
    id: u64,
    tx: mpsc::Sender<()>,
}

/// Process-wide broadcaster registry.
#[derive(Clone, Default)]
pub struct BroadcasterRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    topics: Mutex<HashMap<String, Vec<Observer>>>,
    next_id: AtomicU64,
}

impl BroadcasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. The returned subscription yields a wakeup for
    /// every `notify` and unsubscribes when dropped.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(WAKEUP_BUFFER_SIZE);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.inner.topics.lock().expect("broadcaster lock poisoned");
        topics
            .entry(topic.to_string())
            .or_default()
            .push(Observer { id, tx });
        debug!("subscribed observer {} to {}", id, topic);

        Subscription {
            registry: self.inner.clone(),
            topic: topic.to_string(),
            id,
            rx,
        }
    }

    /// Signal every current subscriber of a topic. One failing (full or
    /// closed) channel never prevents delivery to the rest.
    pub fn notify(&self, topic: &str) {
        let senders: Vec<mpsc::Sender<()>> = {
            let topics = self.inner.topics.lock().expect("broadcaster lock poisoned");
            match topics.get(topic) {
                Some(observers) => observers.iter().map(|o| o.tx.clone()).collect(),
                None => return,
            }
        };

        // Observers are signalled outside the lock so a slow subscriber
        // cannot stall the registry.
        for tx in senders {
            // Full means a wakeup is already pending; closed means the
            // subscription is being dropped.
            let _ = tx.try_send(());
        }
    }

    /// Number of current subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.topics.lock().expect("broadcaster lock poisoned");
        topics.get(topic).map(|o| o.len()).unwrap_or(0)
    }
}

impl RegistryInner {
    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().expect("broadcaster lock poisoned");
        if let Some(observers) = topics.get_mut(topic) {
            observers.retain(|o| o.id != id);
            if observers.is_empty() {
                topics.remove(topic);
            }
        }
        debug!("unsubscribed observer {} from {}", id, topic);
    }
}

/// A live subscription; dropping it unsubscribes.
pub struct Subscription {
    registry: Arc<RegistryInner>,
    topic: String,
    id: u64,
    rx: mpsc::Receiver<()>,
}

impl Subscription {
    /// Wait for the next wakeup. Returns `false` once the subscription can
    /// no longer receive (registry gone).
    pub async fn notified(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_after_subscribe_is_delivered() {
        let registry = BroadcasterRegistry::new();
        let mut sub = registry.subscribe("sessions:p1");
        registry.notify("sessions:p1");
        assert!(sub.notified().await);
    }

    #[tokio::test]
    async fn notify_reaches_all_subscribers() {
        let registry = BroadcasterRegistry::new();
        let mut a = registry.subscribe("presence:p1");
        let mut b = registry.subscribe("presence:p1");
        registry.notify("presence:p1");
        assert!(a.notified().await);
        assert!(b.notified().await);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let registry = BroadcasterRegistry::new();
        let mut a = registry.subscribe("sessions:p1");
        registry.notify("sessions:p2");
        registry.notify("sessions:p1");
        assert!(a.notified().await);
        // Only the matching topic signalled once.
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let registry = BroadcasterRegistry::new();
        {
            let _sub = registry.subscribe("sessions:p1");
            assert_eq!(registry.subscriber_count("sessions:p1"), 1);
        }
        assert_eq!(registry.subscriber_count("sessions:p1"), 0);
    }

    #[tokio::test]
    async fn full_buffer_coalesces_instead_of_losing() {
        let registry = BroadcasterRegistry::new();
        let mut sub = registry.subscribe("sessions:p1");
        for _ in 0..100 {
            registry.notify("sessions:p1");
        }
        // At least one wakeup is pending; the rest coalesced.
        assert!(sub.notified().await);
    }

    #[test]
    fn topic_formatting() {
        assert_eq!(presence_topic("p1"), "presence:p1");
        assert_eq!(sessions_topic("p1"), "sessions:p1");
    }
}
