//! In-memory presence hub.
//!
//! A reference implementation of the presence substrate: per topic it keeps
//! the subscribers and their tracked records, fans out presence changes as a
//! join/leave notice followed by a full sync, and relays named broadcasts.
//! It carries state but never interprets it; every client converges on its own.

mod transport;

pub use transport::HubTransport;

use crate::channel::{ChannelError, ChannelEvent, ChannelResult};
use crate::presence::PresenceSnapshot;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Identifies one subscription on the hub (also its presence key)
pub type ConnRef = String;

struct Subscriber {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    presence: Option<serde_json::Value>,
}

#[derive(Default)]
struct Topic {
    subscribers: HashMap<ConnRef, Subscriber>,
}

impl Topic {
    fn snapshot(&self) -> PresenceSnapshot {
        self.subscribers
            .iter()
            .filter_map(|(key, sub)| sub.presence.clone().map(|p| (key.clone(), vec![p])))
            .collect()
    }

    /// Send to every subscriber (optionally skipping one).
    /// Send errors are ignored; dead subscribers are swept separately.
    fn fan_out(&self, event: &ChannelEvent, except: Option<&str>) {
        for (key, sub) in &self.subscribers {
            if Some(key.as_str()) == except {
                continue;
            }
            let _ = sub.tx.send(event.clone());
        }
    }

    fn announce_join(&self, key: &str, presence: serde_json::Value) {
        self.fan_out(
            &ChannelEvent::Join {
                key: key.to_string(),
                presences: vec![presence],
            },
            None,
        );
        self.fan_out(&ChannelEvent::Sync(self.snapshot()), None);
    }

    fn announce_leave(&self, key: &str, presence: serde_json::Value) {
        self.fan_out(
            &ChannelEvent::Leave {
                key: key.to_string(),
                presences: vec![presence],
            },
            None,
        );
        self.fan_out(&ChannelEvent::Sync(self.snapshot()), None);
    }
}

pub struct PresenceHub {
    topics: RwLock<HashMap<String, Topic>>,
    /// Echo broadcasts back to their sender
    broadcast_self: bool,
}

impl PresenceHub {
    pub fn new(broadcast_self: bool) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            broadcast_self,
        }
    }

    /// Add a subscriber. It immediately receives the current presence state.
    pub async fn subscribe(&self, topic: &str) -> (ConnRef, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_ref = ulid::Ulid::new().to_string();

        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_default();
        let _ = tx.send(ChannelEvent::Sync(entry.snapshot()));
        entry.subscribers.insert(
            conn_ref.clone(),
            Subscriber { tx, presence: None },
        );

        tracing::debug!(
            "Subscriber {} joined {} ({} subscribers)",
            conn_ref,
            topic,
            entry.subscribers.len()
        );
        (conn_ref, rx)
    }

    /// Replace a subscriber's presence record
    pub async fn track(
        &self,
        topic: &str,
        conn_ref: &str,
        presence: serde_json::Value,
    ) -> ChannelResult<()> {
        let mut topics = self.topics.write().await;
        let entry = topics
            .get_mut(topic)
            .ok_or_else(|| ChannelError::NotSubscribed(topic.to_string()))?;
        let subscriber = entry
            .subscribers
            .get_mut(conn_ref)
            .ok_or_else(|| ChannelError::NotSubscribed(topic.to_string()))?;

        subscriber.presence = Some(presence.clone());
        entry.announce_join(conn_ref, presence);
        Ok(())
    }

    /// Remove a subscriber's presence record (no-op when none is tracked)
    pub async fn untrack(&self, topic: &str, conn_ref: &str) -> ChannelResult<()> {
        let mut topics = self.topics.write().await;
        let entry = topics
            .get_mut(topic)
            .ok_or_else(|| ChannelError::NotSubscribed(topic.to_string()))?;
        let subscriber = entry
            .subscribers
            .get_mut(conn_ref)
            .ok_or_else(|| ChannelError::NotSubscribed(topic.to_string()))?;

        if let Some(presence) = subscriber.presence.take() {
            entry.announce_leave(conn_ref, presence);
        }
        Ok(())
    }

    /// Deliver a named event to the topic's other subscribers
    pub async fn broadcast(
        &self,
        topic: &str,
        conn_ref: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> ChannelResult<()> {
        let topics = self.topics.read().await;
        let entry = topics
            .get(topic)
            .filter(|t| t.subscribers.contains_key(conn_ref))
            .ok_or_else(|| ChannelError::NotSubscribed(topic.to_string()))?;

        let except = if self.broadcast_self {
            None
        } else {
            Some(conn_ref)
        };
        entry.fan_out(
            &ChannelEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
            except,
        );
        Ok(())
    }

    /// Drop a subscriber, untracking it first. Empty topics are removed.
    pub async fn unsubscribe(&self, topic: &str, conn_ref: &str) -> ChannelResult<()> {
        let mut topics = self.topics.write().await;
        let entry = topics
            .get_mut(topic)
            .ok_or_else(|| ChannelError::NotSubscribed(topic.to_string()))?;
        let subscriber = entry
            .subscribers
            .remove(conn_ref)
            .ok_or_else(|| ChannelError::NotSubscribed(topic.to_string()))?;

        if let Some(presence) = subscriber.presence {
            entry.announce_leave(conn_ref, presence);
        }
        if entry.subscribers.is_empty() {
            topics.remove(topic);
            tracing::debug!("Topic {} is empty, dropped", topic);
        }
        Ok(())
    }

    /// Remove subscribers whose receivers are gone. Returns how many were pruned.
    pub async fn sweep(&self) -> usize {
        let mut topics = self.topics.write().await;
        let mut pruned = 0;

        for (name, entry) in topics.iter_mut() {
            let dead: Vec<ConnRef> = entry
                .subscribers
                .iter()
                .filter(|(_, sub)| sub.tx.is_closed())
                .map(|(key, _)| key.clone())
                .collect();

            for key in dead {
                if let Some(sub) = entry.subscribers.remove(&key) {
                    pruned += 1;
                    tracing::info!("Pruned dead subscriber {} from {}", key, name);
                    if let Some(presence) = sub.presence {
                        entry.announce_leave(&key, presence);
                    }
                }
            }
        }

        topics.retain(|_, entry| !entry.subscribers.is_empty());
        pruned
    }

    /// Current presence state of a topic (empty for unknown topics)
    pub async fn presence_state(&self, topic: &str) -> PresenceSnapshot {
        self.topics
            .read()
            .await
            .get(topic)
            .map(Topic::snapshot)
            .unwrap_or_default()
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, |t| t.subscribers.len())
    }
}

impl Default for PresenceHub {
    fn default() -> Self {
        Self::new(false)
    }
}
