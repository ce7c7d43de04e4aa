//! One-way notification delivery over `text/event-stream`.
//!
//! Each client stream is a registry connection on its owner's
//! notifications topic, so multiple tabs receive independently and a
//! stalled tab is dropped like any slow socket.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, Interval};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::fanout::{EventHandler, FanoutEvent, FanoutPayload};
use crate::metrics;
use crate::presence::{PresenceLease, PresenceTracker};
use crate::registry::{
    channel, ConnectionId, ConnectionRegistry, Frame, Outbound, OutboundReceiver, RegistryError,
};
use crate::topic::Topic;

const KEEP_ALIVE: &[u8] = b": keep-alive\n\n";
const RETRY_HINT: &[u8] = b"retry: 5000\n\n";

/// Format one server-sent event.
fn sse_frame(event: &str, id: Option<Uuid>, data: &serde_json::Value) -> Frame {
    let mut frame = format!("event: {event}\n");
    if let Some(id) = id {
        frame.push_str(&format!("id: {id}\n"));
    }
    frame.push_str(&format!("data: {data}\n\n"));
    Arc::from(frame)
}

#[derive(Clone)]
pub struct StreamBroadcaster {
    registry: ConnectionRegistry,
    presence: Arc<PresenceTracker>,
    config: StreamConfig,
}

impl StreamBroadcaster {
    pub fn new(
        registry: ConnectionRegistry,
        presence: Arc<PresenceTracker>,
        config: StreamConfig,
    ) -> Self {
        Self {
            registry,
            presence,
            config,
        }
    }

    /// Open a stream for `user_id`. Dropping the returned stream removes it.
    pub fn add_client(&self, user_id: Uuid) -> Result<NotificationStream, RegistryError> {
        let (handle, rx) = channel(self.config.buffer);
        let connection_id =
            self.registry
                .register(user_id, Topic::Notifications(user_id), handle)?;
        let lease = self.presence.connect(user_id);
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "notification stream opened");

        let period = self.config.keepalive_interval;
        Ok(NotificationStream {
            rx,
            keepalive: interval_at(Instant::now() + period, period),
            guard: ClientGuard {
                registry: self.registry.clone(),
                presence: self.presence.clone(),
                connection_id,
                lease,
            },
            opened: false,
        })
    }

    pub fn client_count(&self, user_id: Uuid) -> usize {
        self.registry
            .subscriber_count(&Topic::Notifications(user_id))
    }

    fn frame_for(payload: &FanoutPayload) -> Option<Frame> {
        match payload {
            FanoutPayload::NotificationCreated(notification) => {
                let data = serde_json::to_value(notification.view()).ok()?;
                Some(sse_frame("notification", Some(notification.id), &data))
            }
            FanoutPayload::NotificationRead {
                notification_ids,
                all,
            } => Some(sse_frame(
                "notification-read",
                None,
                &json!({ "notificationIds": notification_ids, "all": all }),
            )),
            FanoutPayload::NotificationDeleted { notification_id } => Some(sse_frame(
                "notification-deleted",
                None,
                &json!({ "notificationId": notification_id }),
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl EventHandler for StreamBroadcaster {
    async fn handle(&self, event: &FanoutEvent) {
        let Topic::Notifications(_) = event.topic else {
            return;
        };
        let Some(frame) = Self::frame_for(&event.event) else {
            return;
        };
        let delivered = self.registry.deliver_local(&event.topic, frame);
        if delivered > 0 {
            metrics::FRAMES_DELIVERED
                .with_label_values(&[event.event.event_type()])
                .inc_by(delivered as u64);
        }
    }
}

/// Releases the registry entry and the presence device slot.
struct ClientGuard {
    registry: ConnectionRegistry,
    presence: Arc<PresenceTracker>,
    connection_id: ConnectionId,
    lease: PresenceLease,
}

impl ClientGuard {
    fn heartbeat(&mut self) {
        self.registry.touch(self.connection_id);
        self.presence.heartbeat(&mut self.lease);
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.connection_id);
        self.presence.disconnect(self.lease);
        tracing::info!(
            user_id = %self.lease.user_id(),
            connection_id = %self.connection_id,
            "notification stream closed"
        );
    }
}

pub struct NotificationStream {
    rx: OutboundReceiver,
    keepalive: Interval,
    guard: ClientGuard,
    opened: bool,
}

impl NotificationStream {
    pub fn connection_id(&self) -> ConnectionId {
        self.guard.connection_id
    }

    /// Body stream: a retry hint, then events interleaved with keep-alive
    /// comments. Ends when the registry closes the connection.
    pub fn into_body(self) -> impl Stream<Item = Result<Bytes, Infallible>> + 'static {
        stream::unfold(Some(self), |state| async move {
            let mut state = state?;
            if !state.opened {
                state.opened = true;
                return Some((Ok(Bytes::from_static(RETRY_HINT)), Some(state)));
            }

            tokio::select! {
                outbound = state.rx.recv() => match outbound {
                    Outbound::Frame(frame) => {
                        Some((Ok(Bytes::copy_from_slice(frame.as_bytes())), Some(state)))
                    }
                    Outbound::Closed(reason) => {
                        tracing::debug!(
                            connection_id = %state.guard.connection_id,
                            reason = reason.map(|r| r.description()),
                            "notification stream ended"
                        );
                        None
                    }
                },
                _ = state.keepalive.tick() => {
                    state.guard.heartbeat();
                    Some((Ok(Bytes::from_static(KEEP_ALIVE)), Some(state)))
                }
            }
        })
    }
}
