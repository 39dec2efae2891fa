//! Relay message dispatch
//!
//! Each socket owns a [`Connection`] holding its hub subscriptions. Hub events
//! for a topic are forwarded into the connection's outgoing queue by a small
//! task per subscription.

use crate::channel::ChannelError;
use crate::hub::ConnRef;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ActiveSubscription {
    conn_ref: ConnRef,
    forwarder: JoinHandle<()>,
}

/// Per-socket relay state
pub struct Connection {
    id: String,
    subscriptions: HashMap<String, ActiveSubscription>,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
}

impl Connection {
    pub fn new(outgoing: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            subscriptions: HashMap::new(),
            outgoing,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Untrack and unsubscribe every topic (socket closed)
    pub async fn close(mut self, state: &AppState) {
        for (topic, sub) in self.subscriptions.drain() {
            release(state, &topic, sub).await;
        }
        if let Some(limiter) = &state.rate_limiter {
            limiter.forget(&self.id).await;
        }
    }
}

async fn release(state: &AppState, topic: &str, sub: ActiveSubscription) {
    if let Err(e) = state.hub.unsubscribe(topic, &sub.conn_ref).await {
        tracing::debug!("Releasing {} on {}: {}", sub.conn_ref, topic, e);
    }
    sub.forwarder.abort();
}

fn channel_error(e: ChannelError) -> ServerMessage {
    let code = match e {
        ChannelError::NotSubscribed(_) => "NOT_SUBSCRIBED",
        _ => "CHANNEL_ERROR",
    };
    ServerMessage::error(code, e.to_string())
}

fn not_subscribed(topic: &str) -> ServerMessage {
    channel_error(ChannelError::NotSubscribed(topic.to_string()))
}

/// Handle one client message and return an optional direct response
pub async fn handle_message(
    msg: ClientMessage,
    conn: &mut Connection,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Subscribe { topic } => handle_subscribe(conn, state, topic).await,

        ClientMessage::Track { topic, payload } => {
            let Some(sub) = conn.subscriptions.get(&topic) else {
                return Some(not_subscribed(&topic));
            };
            if !payload.is_object() {
                return Some(ServerMessage::error(
                    "INVALID_PAYLOAD",
                    "Presence payload must be a JSON object",
                ));
            }
            state
                .hub
                .track(&topic, &sub.conn_ref, payload)
                .await
                .err()
                .map(channel_error)
        }

        ClientMessage::Untrack { topic } => {
            let Some(sub) = conn.subscriptions.get(&topic) else {
                return Some(not_subscribed(&topic));
            };
            state
                .hub
                .untrack(&topic, &sub.conn_ref)
                .await
                .err()
                .map(channel_error)
        }

        ClientMessage::Broadcast {
            topic,
            event,
            payload,
        } => {
            let Some(sub) = conn.subscriptions.get(&topic) else {
                return Some(not_subscribed(&topic));
            };
            tracing::debug!("Broadcast {} on {} from {}", event, topic, conn.id);
            state
                .hub
                .broadcast(&topic, &sub.conn_ref, &event, payload)
                .await
                .err()
                .map(channel_error)
        }

        ClientMessage::Unsubscribe { topic } => {
            let Some(sub) = conn.subscriptions.remove(&topic) else {
                return Some(not_subscribed(&topic));
            };
            release(state, &topic, sub).await;
            tracing::info!("Connection {} left {}", conn.id, topic);
            None
        }
    }
}

async fn handle_subscribe(
    conn: &mut Connection,
    state: &Arc<AppState>,
    topic: String,
) -> Option<ServerMessage> {
    // Re-subscribing is idempotent
    if let Some(sub) = conn.subscriptions.get(&topic) {
        return Some(ServerMessage::Subscribed {
            topic,
            key: sub.conn_ref.clone(),
        });
    }

    let (conn_ref, mut events) = state.hub.subscribe(&topic).await;
    let outgoing = conn.outgoing.clone();
    let forward_topic = topic.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if outgoing
                .send(ServerMessage::from_event(&forward_topic, event))
                .is_err()
            {
                break;
            }
        }
    });

    tracing::info!(
        "Connection {} joined {} as {} ({} subscribers)",
        conn.id,
        topic,
        conn_ref,
        state.hub.subscriber_count(&topic).await
    );
    conn.subscriptions.insert(
        topic.clone(),
        ActiveSubscription {
            conn_ref: conn_ref.clone(),
            forwarder,
        },
    );
    Some(ServerMessage::Subscribed {
        topic,
        key: conn_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(tx), rx)
    }

    #[tokio::test]
    async fn test_subscribe_then_track() {
        let state = Arc::new(AppState::default());
        let (mut conn, mut rx) = connection();

        let key = match handle_message(
            ClientMessage::Subscribe {
                topic: "session:a".to_string(),
            },
            &mut conn,
            &state,
        )
        .await
        {
            Some(ServerMessage::Subscribed { topic, key }) => {
                assert_eq!(topic, "session:a");
                key
            }
            other => panic!("Expected Subscribed, got {:?}", other),
        };

        // The forwarder delivers the initial state
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::PresenceState { ref state, .. }) if state.is_empty()
        ));

        let response = handle_message(
            ClientMessage::Track {
                topic: "session:a".to_string(),
                payload: json!({ "userId": "u1", "name": "Ann" }),
            },
            &mut conn,
            &state,
        )
        .await;
        assert!(response.is_none());
        assert!(matches!(rx.recv().await, Some(ServerMessage::PresenceJoin { .. })));

        let snapshot = state.hub.presence_state("session:a").await;
        assert_eq!(snapshot[&key], vec![json!({ "userId": "u1", "name": "Ann" })]);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let state = Arc::new(AppState::default());
        let (mut conn, _rx) = connection();
        let subscribe = || ClientMessage::Subscribe {
            topic: "session:a".to_string(),
        };

        let first = handle_message(subscribe(), &mut conn, &state).await;
        let second = handle_message(subscribe(), &mut conn, &state).await;
        assert_eq!(first, second);
        assert_eq!(state.hub.subscriber_count("session:a").await, 1);
    }

    #[tokio::test]
    async fn test_operations_require_subscription() {
        let state = Arc::new(AppState::default());
        let (mut conn, _rx) = connection();

        let response = handle_message(
            ClientMessage::Track {
                topic: "session:a".to_string(),
                payload: json!({}),
            },
            &mut conn,
            &state,
        )
        .await;
        assert!(matches!(
            response,
            Some(ServerMessage::Error { ref code, .. }) if code == "NOT_SUBSCRIBED"
        ));

        let response = handle_message(
            ClientMessage::Unsubscribe {
                topic: "session:a".to_string(),
            },
            &mut conn,
            &state,
        )
        .await;
        assert!(matches!(response, Some(ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn test_track_rejects_non_object_payload() {
        let state = Arc::new(AppState::default());
        let (mut conn, _rx) = connection();
        handle_message(
            ClientMessage::Subscribe {
                topic: "session:a".to_string(),
            },
            &mut conn,
            &state,
        )
        .await;

        let response = handle_message(
            ClientMessage::Track {
                topic: "session:a".to_string(),
                payload: json!([1, 2]),
            },
            &mut conn,
            &state,
        )
        .await;
        assert!(matches!(
            response,
            Some(ServerMessage::Error { ref code, .. }) if code == "INVALID_PAYLOAD"
        ));
    }

    #[tokio::test]
    async fn test_close_releases_all_topics() {
        let state = Arc::new(AppState::default());
        let (mut conn, _rx) = connection();
        for topic in ["session:a", "session:b"] {
            handle_message(
                ClientMessage::Subscribe {
                    topic: topic.to_string(),
                },
                &mut conn,
                &state,
            )
            .await;
            handle_message(
                ClientMessage::Track {
                    topic: topic.to_string(),
                    payload: json!({ "userId": "u1" }),
                },
                &mut conn,
                &state,
            )
            .await;
        }
        assert_eq!(conn.topics().len(), 2);
        assert_eq!(state.hub.topic_count().await, 2);

        conn.close(&state).await;
        assert_eq!(state.hub.topic_count().await, 0);
    }
}
