//! Channel adapter.
//!
//! The presence substrate is consumed through two traits:
//! [`PresenceTransport`] opens confirmed subscriptions and [`ChannelHandle`]
//! publishes on one. Substrate callbacks (presence sync, join/leave, named
//! broadcasts) arrive as [`ChannelEvent`]s on the subscription's event stream.
//!
//! [`SessionChannel`] binds one session to a subscription and applies the
//! transport error policy: every failure is logged and swallowed, the next
//! presence sync is what corrects the view.

pub mod ws;

use crate::presence::PresenceSnapshot;
use crate::types::{PresenceRecord, RESET_VOTES_EVENT};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    #[error("Subscription to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Events delivered by the substrate for one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Complete current presence state
    Sync(PresenceSnapshot),
    Join {
        key: String,
        presences: Vec<serde_json::Value>,
    },
    Leave {
        key: String,
        presences: Vec<serde_json::Value>,
    },
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
}

/// Publishing side of a subscription
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Publish this client's presence record, replacing the previous one
    async fn track(&self, record: &PresenceRecord) -> ChannelResult<()>;

    /// Remove this client's presence record
    async fn untrack(&self) -> ChannelResult<()>;

    /// Fire-and-forget named message to the other subscribers
    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> ChannelResult<()>;

    async fn unsubscribe(&self) -> ChannelResult<()>;
}

/// A confirmed subscription to a topic
pub struct Subscription {
    pub topic: String,
    pub handle: Box<dyn ChannelHandle>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// The presence/broadcast substrate
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    /// Subscribe to a topic; resolves once the subscription is confirmed
    async fn subscribe(&self, topic: &str) -> ChannelResult<Subscription>;
}

/// Channel topic for a session
pub fn session_topic(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// One session's subscription, owned by the session manager
pub struct SessionChannel {
    topic: String,
    handle: Box<dyn ChannelHandle>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    last_tracked: Option<PresenceRecord>,
}

impl SessionChannel {
    pub async fn open(transport: &dyn PresenceTransport, session_id: &str) -> ChannelResult<Self> {
        let topic = session_topic(session_id);
        let subscription = transport.subscribe(&topic).await?;
        tracing::info!("Subscribed to {}", subscription.topic);

        Ok(Self {
            topic: subscription.topic,
            handle: subscription.handle,
            events: subscription.events,
            last_tracked: None,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a presence record. Failures are logged; the next sync corrects.
    pub async fn track(&mut self, record: PresenceRecord) {
        match self.handle.track(&record).await {
            Ok(()) => self.last_tracked = Some(record),
            Err(e) => {
                tracing::warn!("Presence track on {} failed: {}", self.topic, e);
                self.last_tracked = None;
            }
        }
    }

    /// Like [`SessionChannel::track`], but skipped when the record is identical
    /// to the last one published. Used for re-tracks triggered from incoming
    /// events so repeated deliveries don't echo back onto the channel.
    pub async fn track_if_changed(&mut self, record: PresenceRecord) {
        if self.last_tracked.as_ref() == Some(&record) {
            tracing::debug!("Skipping unchanged presence re-track on {}", self.topic);
            return;
        }
        self.track(record).await;
    }

    /// Our record is no longer visible on the channel; the next re-track must go out
    pub fn invalidate_tracked(&mut self) {
        self.last_tracked = None;
    }

    pub async fn broadcast_reset(&self) {
        if let Err(e) = self
            .handle
            .broadcast(RESET_VOTES_EVENT, serde_json::json!({}))
            .await
        {
            tracing::warn!("Reset broadcast on {} failed: {}", self.topic, e);
        }
    }

    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Next already-queued event, if any
    pub fn try_next_event(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }

    /// Untrack and unsubscribe. Best-effort: a half-closed channel must never
    /// block opening the next one.
    pub async fn close(mut self) {
        if let Err(e) = self.handle.untrack().await {
            tracing::debug!("Ignoring untrack failure on {}: {}", self.topic, e);
        }
        if let Err(e) = self.handle.unsubscribe().await {
            tracing::debug!("Ignoring unsubscribe failure on {}: {}", self.topic, e);
        }
        self.events.close();
        tracing::info!("Left {}", self.topic);
    }
}
