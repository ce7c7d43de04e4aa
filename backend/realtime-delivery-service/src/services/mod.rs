//! Persist-then-publish pipelines.
//!
//! Every mutation commits to the [`ChatStore`](crate::store::ChatStore)
//! before its fanout event is published. A failed publish only loses the
//! real-time push; clients reconcile through the REST read endpoints.

pub mod chat_service;
pub mod message_service;
pub mod notification_service;
pub mod unread;

pub use chat_service::{ChatService, CreateChatRequest, MAX_CHAT_PARTICIPANTS};
pub use message_service::{MessageService, MAX_PAGE_SIZE};
pub use notification_service::{
    BulkCreateOutcome, BulkFailure, NotificationService, MAX_BULK_NOTIFICATIONS,
};
pub use unread::UnreadCache;

use crate::fanout::{FanoutBridge, FanoutPayload};
use crate::topic::Topic;

pub(crate) async fn publish_after_commit(bridge: &FanoutBridge, topic: Topic, payload: FanoutPayload) {
    let event_type = payload.event_type();
    if let Err(e) = bridge.publish(topic, payload).await {
        tracing::warn!(
            topic = %topic,
            event_type,
            error = %e,
            "publish after commit failed, real-time update lost"
        );
    }
}
