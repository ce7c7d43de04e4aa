use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Notification, ReadReceipt};
use crate::presence::PresenceSnapshot;
use crate::topic::Topic;

/// Wire unit on the backbone. Transient and delivered at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutEvent {
    pub event_id: Uuid,
    pub topic: Topic,
    pub event: FanoutPayload,
    pub origin_ts: DateTime<Utc>,
    pub origin_instance: Uuid,
}

impl FanoutEvent {
    pub fn new(topic: Topic, event: FanoutPayload, origin_instance: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            topic,
            event,
            origin_ts: Utc::now(),
            origin_instance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum FanoutPayload {
    MessageCreated(Message),
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        chat_id: Uuid,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    },
    ReadReceipt(ReadReceipt),
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: Uuid, user_id: Uuid },
    PresenceChanged(PresenceSnapshot),
    NotificationCreated(Notification),
    #[serde(rename_all = "camelCase")]
    NotificationRead {
        notification_ids: Vec<Uuid>,
        all: bool,
    },
    #[serde(rename_all = "camelCase")]
    NotificationDeleted { notification_id: Uuid },
}

impl FanoutPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            FanoutPayload::MessageCreated(_) => "message-created",
            FanoutPayload::MessageDeleted { .. } => "message-deleted",
            FanoutPayload::ReadReceipt(_) => "read-receipt",
            FanoutPayload::Typing { .. } => "typing",
            FanoutPayload::PresenceChanged(_) => "presence-changed",
            FanoutPayload::NotificationCreated(_) => "notification-created",
            FanoutPayload::NotificationRead { .. } => "notification-read",
            FanoutPayload::NotificationDeleted { .. } => "notification-deleted",
        }
    }
}
