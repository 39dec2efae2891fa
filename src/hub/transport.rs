use super::{ConnRef, PresenceHub};
use crate::channel::{ChannelHandle, ChannelResult, PresenceTransport, Subscription};
use crate::types::PresenceRecord;
use async_trait::async_trait;
use std::sync::Arc;

/// In-process transport: every client shares the same hub
#[derive(Clone)]
pub struct HubTransport {
    hub: Arc<PresenceHub>,
}

impl HubTransport {
    pub fn new(hub: Arc<PresenceHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl PresenceTransport for HubTransport {
    async fn subscribe(&self, topic: &str) -> ChannelResult<Subscription> {
        let (conn_ref, events) = self.hub.subscribe(topic).await;
        Ok(Subscription {
            topic: topic.to_string(),
            handle: Box::new(HubHandle {
                hub: Arc::clone(&self.hub),
                topic: topic.to_string(),
                conn_ref,
            }),
            events,
        })
    }
}

struct HubHandle {
    hub: Arc<PresenceHub>,
    topic: String,
    conn_ref: ConnRef,
}

#[async_trait]
impl ChannelHandle for HubHandle {
    async fn track(&self, record: &PresenceRecord) -> ChannelResult<()> {
        let presence = serde_json::to_value(record)?;
        self.hub.track(&self.topic, &self.conn_ref, presence).await
    }

    async fn untrack(&self) -> ChannelResult<()> {
        self.hub.untrack(&self.topic, &self.conn_ref).await
    }

    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> ChannelResult<()> {
        self.hub
            .broadcast(&self.topic, &self.conn_ref, event, payload)
            .await
    }

    async fn unsubscribe(&self) -> ChannelResult<()> {
        self.hub.unsubscribe(&self.topic, &self.conn_ref).await
    }
}
