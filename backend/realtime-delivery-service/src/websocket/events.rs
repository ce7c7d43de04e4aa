//! Bridge subscribers that turn fanout events into socket frames.

use async_trait::async_trait;
use std::sync::Arc;

use super::message_types::ServerFrame;
use crate::fanout::{EventHandler, FanoutEvent, FanoutPayload};
use crate::metrics;
use crate::presence::PresenceDirectory;
use crate::registry::ConnectionRegistry;
use crate::services::UnreadCache;
use crate::topic::Topic;

fn deliver(registry: &ConnectionRegistry, event: &FanoutEvent, frame: ServerFrame) -> usize {
    let Some(encoded) = frame.encode() else {
        return 0;
    };
    let delivered = registry.deliver_local(&event.topic, encoded);
    if delivered > 0 {
        metrics::FRAMES_DELIVERED
            .with_label_values(&[event.event.event_type()])
            .inc_by(delivered as u64);
    }
    delivered
}

/// Handles `chat:*`.
pub struct ChatFanoutHandler {
    registry: ConnectionRegistry,
    unread: UnreadCache,
}

impl ChatFanoutHandler {
    pub fn new(registry: ConnectionRegistry, unread: UnreadCache) -> Self {
        Self { registry, unread }
    }
}

#[async_trait]
impl EventHandler for ChatFanoutHandler {
    async fn handle(&self, event: &FanoutEvent) {
        let Topic::Chat(chat_id) = event.topic else {
            return;
        };

        let frame = match &event.event {
            FanoutPayload::MessageCreated(message) => {
                self.unread.invalidate_chat(chat_id);
                ServerFrame::Message(message.clone())
            }
            FanoutPayload::MessageDeleted {
                chat_id,
                message_id,
                deleted_at,
            } => {
                self.unread.invalidate_chat(*chat_id);
                ServerFrame::MessageDeleted {
                    chat_id: *chat_id,
                    message_id: *message_id,
                    deleted_at: *deleted_at,
                }
            }
            FanoutPayload::ReadReceipt(receipt) => {
                self.unread.invalidate(receipt.chat_id, receipt.user_id).await;
                ServerFrame::ReadReceipt(receipt.clone())
            }
            FanoutPayload::Typing { chat_id, user_id } => ServerFrame::Typing {
                chat_id: *chat_id,
                user_id: *user_id,
            },
            other => {
                tracing::debug!(event_type = other.event_type(), chat_id = %chat_id, "ignoring event on chat topic");
                return;
            }
        };

        let delivered = deliver(&self.registry, event, frame);
        tracing::trace!(chat_id = %chat_id, event_type = event.event.event_type(), delivered, "chat event delivered");
    }
}

/// Handles `presence:*`: folds the snapshot into the directory and pushes
/// the aggregate view when it changed.
pub struct PresenceFanoutHandler {
    registry: ConnectionRegistry,
    directory: Arc<PresenceDirectory>,
}

impl PresenceFanoutHandler {
    pub fn new(registry: ConnectionRegistry, directory: Arc<PresenceDirectory>) -> Self {
        Self {
            registry,
            directory,
        }
    }
}

#[async_trait]
impl EventHandler for PresenceFanoutHandler {
    async fn handle(&self, event: &FanoutEvent) {
        let FanoutPayload::PresenceChanged(snapshot) = &event.event else {
            return;
        };
        if let Some(view) = self.directory.apply(snapshot) {
            deliver(&self.registry, event, ServerFrame::Presence(view));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::models::Message;
    use crate::presence::{PresenceSnapshot, PresenceStatus};
    use crate::registry::{channel, Outbound};
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn message_events_reach_chat_sockets() {
        let registry = ConnectionRegistry::new(&RegistryConfig::default());
        let handler = ChatFanoutHandler::new(registry.clone(), UnreadCache::disabled());
        let chat_id = Uuid::new_v4();
        let (handle, mut rx) = channel(4);
        registry
            .register(Uuid::new_v4(), Topic::Chat(chat_id), handle)
            .unwrap();

        let message = Message {
            id: Uuid::new_v4(),
            chat_id,
            author_id: Uuid::new_v4(),
            content: "hello".into(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        handler
            .handle(&FanoutEvent::new(
                Topic::Chat(chat_id),
                FanoutPayload::MessageCreated(message),
                Uuid::new_v4(),
            ))
            .await;

        let Outbound::Frame(frame) = rx.recv().await else {
            panic!("expected a frame");
        };
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "MESSAGE");
        assert_eq!(value["content"], "hello");
    }

    #[tokio::test]
    async fn presence_is_pushed_only_on_change() {
        let registry = ConnectionRegistry::new(&RegistryConfig::default());
        let directory = Arc::new(PresenceDirectory::new(Duration::from_secs(90)));
        let handler = PresenceFanoutHandler::new(registry.clone(), directory.clone());
        let user_id = Uuid::new_v4();
        let (handle, mut rx) = channel(4);
        registry
            .register(Uuid::new_v4(), Topic::Presence(user_id), handle)
            .unwrap();

        let instance_id = Uuid::new_v4();
        let snapshot = |seq| PresenceSnapshot {
            user_id,
            instance_id,
            status: PresenceStatus::Online,
            device_count: 1,
            seq,
            at: Utc::now(),
        };
        for seq in 1..=2 {
            handler
                .handle(&FanoutEvent::new(
                    Topic::Presence(user_id),
                    FanoutPayload::PresenceChanged(snapshot(seq)),
                    instance_id,
                ))
                .await;
        }

        let Outbound::Frame(frame) = rx.recv().await else {
            panic!("expected a frame");
        };
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "PRESENCE");
        assert_eq!(value["status"], "online");

        // The identical second snapshot produced nothing.
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err());
        assert_eq!(directory.view(user_id).status, PresenceStatus::Online);
    }
}
