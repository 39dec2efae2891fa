//! Relay wire protocol (JSON over WebSocket, tagged by `t`)

use crate::channel::ChannelEvent;
use crate::presence::PresenceSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topic: String,
    },
    Track {
        topic: String,
        payload: serde_json::Value,
    },
    Untrack {
        topic: String,
    },
    Broadcast {
        topic: String,
        event: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Unsubscribe {
        topic: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription confirmed; `key` is this connection's presence key
    Subscribed {
        topic: String,
        key: String,
    },
    /// Full presence state of a topic
    PresenceState {
        topic: String,
        state: PresenceSnapshot,
    },
    PresenceJoin {
        topic: String,
        key: String,
        presences: Vec<serde_json::Value>,
    },
    PresenceLeave {
        topic: String,
        key: String,
        presences: Vec<serde_json::Value>,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: serde_json::Value,
    },
    Error {
        code: String,
        msg: String,
    },
}

impl ServerMessage {
    pub fn from_event(topic: &str, event: ChannelEvent) -> Self {
        let topic = topic.to_string();
        match event {
            ChannelEvent::Sync(state) => ServerMessage::PresenceState { topic, state },
            ChannelEvent::Join { key, presences } => ServerMessage::PresenceJoin {
                topic,
                key,
                presences,
            },
            ChannelEvent::Leave { key, presences } => ServerMessage::PresenceLeave {
                topic,
                key,
                presences,
            },
            ChannelEvent::Broadcast { event, payload } => ServerMessage::Broadcast {
                topic,
                event,
                payload,
            },
        }
    }

    /// Split back into topic and channel event (None for control messages)
    pub fn into_event(self) -> Option<(String, ChannelEvent)> {
        match self {
            ServerMessage::PresenceState { topic, state } => {
                Some((topic, ChannelEvent::Sync(state)))
            }
            ServerMessage::PresenceJoin {
                topic,
                key,
                presences,
            } => Some((topic, ChannelEvent::Join { key, presences })),
            ServerMessage::PresenceLeave {
                topic,
                key,
                presences,
            } => Some((topic, ChannelEvent::Leave { key, presences })),
            ServerMessage::Broadcast {
                topic,
                event,
                payload,
            } => Some((topic, ChannelEvent::Broadcast { event, payload })),
            ServerMessage::Subscribed { .. } | ServerMessage::Error { .. } => None,
        }
    }

    pub fn error(code: &str, msg: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            msg: msg.into(),
        }
    }
}
