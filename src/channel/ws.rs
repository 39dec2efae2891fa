//! WebSocket transport speaking the relay protocol.
//!
//! Each subscription gets its own socket. A writer task drains outgoing
//! messages, a reader task turns server frames for the topic into
//! [`ChannelEvent`]s. Dropping the handle closes the socket.

use super::{
    ChannelError, ChannelEvent, ChannelHandle, ChannelResult, PresenceTransport, Subscription,
};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::types::PresenceRecord;
use async_trait::async_trait;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `url` is the relay's socket endpoint, e.g. `ws://127.0.0.1:4000/ws`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn transport_error(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

#[async_trait]
impl PresenceTransport for WsTransport {
    async fn subscribe(&self, topic: &str) -> ChannelResult<Subscription> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(transport_error)?;
        let (mut sink, mut stream) = socket.split();

        let subscribe = serde_json::to_string(&ClientMessage::Subscribe {
            topic: topic.to_string(),
        })?;
        sink.send(Message::text(subscribe))
            .await
            .map_err(transport_error)?;

        // Wait for the relay to confirm before handing out the subscription
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(ServerMessage::Subscribed {
                            topic: confirmed,
                            key,
                        }) if confirmed == topic => {
                            tracing::debug!("Relay confirmed {} as {}", topic, key);
                            break;
                        }
                        Ok(ServerMessage::Error { code, msg }) => {
                            return Err(ChannelError::Rejected {
                                topic: topic.to_string(),
                                reason: format!("{}: {}", code, msg),
                            });
                        }
                        Ok(other) => {
                            tracing::debug!("Ignoring {:?} before subscription ack", other);
                        }
                        Err(e) => {
                            tracing::warn!("Unparseable relay message: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport_error(e)),
            }
        }

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to encode {:?}: {}", msg, e);
                        continue;
                    }
                };
                if sink.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let parsed = serde_json::from_str::<ServerMessage>(text.as_str());
                        let server_msg = match parsed {
                            Ok(server_msg) => server_msg,
                            Err(e) => {
                                tracing::warn!("Unparseable relay message: {}", e);
                                continue;
                            }
                        };
                        if let ServerMessage::Error { code, msg } = &server_msg {
                            tracing::warn!("Relay error on {}: {} {}", reader_topic, code, msg);
                            continue;
                        }
                        if let Some((topic, event)) = server_msg.into_event() {
                            if topic == reader_topic && events_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Relay socket error on {}: {}", reader_topic, e);
                        break;
                    }
                }
            }
            tracing::debug!("Relay reader for {} finished", reader_topic);
        });

        Ok(Subscription {
            topic: topic.to_string(),
            handle: Box::new(WsHandle {
                topic: topic.to_string(),
                outgoing: outgoing_tx,
            }),
            events: events_rx,
        })
    }
}

struct WsHandle {
    topic: String,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
}

impl WsHandle {
    fn send(&self, msg: ClientMessage) -> ChannelResult<()> {
        self.outgoing.send(msg).map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl ChannelHandle for WsHandle {
    async fn track(&self, record: &PresenceRecord) -> ChannelResult<()> {
        self.send(ClientMessage::Track {
            topic: self.topic.clone(),
            payload: serde_json::to_value(record)?,
        })
    }

    async fn untrack(&self) -> ChannelResult<()> {
        self.send(ClientMessage::Untrack {
            topic: self.topic.clone(),
        })
    }

    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> ChannelResult<()> {
        self.send(ClientMessage::Broadcast {
            topic: self.topic.clone(),
            event: event.to_string(),
            payload,
        })
    }

    async fn unsubscribe(&self) -> ChannelResult<()> {
        self.send(ClientMessage::Unsubscribe {
            topic: self.topic.clone(),
        })
    }
}
