//! Cross-instance fanout.
//!
//! [`FanoutBridge::publish`] delivers an event to this instance's handlers
//! first and then broadcasts it on the [`Backbone`]; the bridge's
//! subscription loop hands events from other instances to the same
//! handlers. A lost backbone connection is re-established with exponential
//! backoff while local delivery keeps working.

pub mod backbone;
pub mod event;
pub mod redis_backbone;

pub use self::backbone::{Backbone, BackboneMessage, BackboneStream, MemoryBackbone};
pub use self::event::{FanoutEvent, FanoutPayload};
pub use self::redis_backbone::RedisBackbone;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use resilience::{Backoff, BackoffConfig};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::config::FanoutConfig;
use crate::metrics;
use crate::topic::{matches_pattern, Topic};

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backbone disconnected: {0}")]
    Disconnected(String),
}

/// Receives every event whose channel matches the pattern it was
/// subscribed with.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &FanoutEvent);
}

/// Bounded memory of recently dispatched event ids.
struct RecentEvents {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if the id was already seen.
    fn insert(&mut self, id: Uuid) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

enum SessionEnd {
    Disconnected,
    Resubscribe,
    Shutdown,
}

pub struct FanoutBridge {
    backbone: Arc<dyn Backbone>,
    instance_id: Uuid,
    config: FanoutConfig,
    handlers: DashMap<String, Arc<dyn EventHandler>>,
    recent: Mutex<RecentEvents>,
    patterns_version: watch::Sender<u64>,
    connected: watch::Sender<bool>,
    reconnects: AtomicU64,
}

impl FanoutBridge {
    pub fn new(backbone: Arc<dyn Backbone>, instance_id: Uuid, config: FanoutConfig) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let (patterns_version, _) = watch::channel(0);
        Arc::new(Self {
            backbone,
            instance_id,
            recent: Mutex::new(RecentEvents::new(config.dedup_window)),
            config,
            handlers: DashMap::new(),
            patterns_version,
            connected,
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Register the handler for `pattern`, replacing any previous one.
    /// Returns true when the pattern is new, which triggers a resubscribe.
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> bool {
        let pattern = pattern.into();
        let is_new = self.handlers.insert(pattern.clone(), handler).is_none();
        if is_new {
            tracing::info!(pattern = %pattern, "fanout pattern registered");
            self.patterns_version.send_modify(|v| *v += 1);
        }
        is_new
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        patterns.sort();
        patterns
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Wait until the subscription loop holds a live subscription.
    pub async fn wait_connected(&self) {
        let mut rx = self.connected.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    /// Deliver locally, then broadcast. Local delivery happens even if the
    /// backbone is down; the error only reports the lost broadcast.
    pub async fn publish(
        &self,
        topic: Topic,
        payload: FanoutPayload,
    ) -> Result<FanoutEvent, FanoutError> {
        let event = FanoutEvent::new(topic, payload, self.instance_id);
        self.dispatch(&event).await;

        let encoded = serde_json::to_string(&event)?;
        if let Err(e) = self.backbone.publish(&topic.channel(), encoded).await {
            metrics::FANOUT_PUBLISH_FAILURES.inc();
            return Err(e);
        }
        Ok(event)
    }

    async fn dispatch(&self, event: &FanoutEvent) -> bool {
        if !self.recent.lock().await.insert(event.event_id) {
            tracing::debug!(event_id = %event.event_id, "duplicate fanout event ignored");
            return false;
        }

        let channel = event.topic.channel();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .iter()
            .filter(|entry| matches_pattern(entry.key(), &channel))
            .map(|entry| entry.value().clone())
            .collect();

        for handler in handlers {
            handler.handle(event).await;
        }
        true
    }

    async fn on_backbone_message(&self, message: BackboneMessage) {
        let event: FanoutEvent = match serde_json::from_str(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                metrics::FANOUT_EVENTS_RECEIVED
                    .with_label_values(&["malformed"])
                    .inc();
                tracing::warn!(channel = %message.channel, error = %e, "malformed fanout event");
                return;
            }
        };

        if event.origin_instance == self.instance_id {
            metrics::FANOUT_EVENTS_RECEIVED
                .with_label_values(&["own"])
                .inc();
            return;
        }

        let outcome = if self.dispatch(&event).await {
            "delivered"
        } else {
            "duplicate"
        };
        metrics::FANOUT_EVENTS_RECEIVED
            .with_label_values(&[outcome])
            .inc();
    }

    /// Subscription loop. Runs until `shutdown` flips to true or its sender
    /// is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: self.config.initial_backoff,
            max: self.config.max_backoff,
            ..BackoffConfig::default()
        });
        let mut patterns_rx = self.patterns_version.subscribe();
        let mut lost = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            patterns_rx.borrow_and_update();
            let patterns = self.patterns();
            if patterns.is_empty() {
                tokio::select! {
                    _ = patterns_rx.changed() => continue,
                    _ = shutdown.changed() => break,
                }
            }

            match self.backbone.subscribe(&patterns).await {
                Ok(mut stream) => {
                    if lost {
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                        metrics::BRIDGE_RECONNECTS.inc();
                        tracing::info!(patterns = ?patterns, "fanout bridge reconnected");
                    } else {
                        tracing::info!(patterns = ?patterns, "fanout bridge subscribed");
                    }
                    lost = false;
                    backoff.reset();
                    self.connected.send_replace(true);

                    let end = loop {
                        tokio::select! {
                            message = stream.next() => match message {
                                Some(message) => self.on_backbone_message(message).await,
                                None => break SessionEnd::Disconnected,
                            },
                            _ = patterns_rx.changed() => break SessionEnd::Resubscribe,
                            _ = shutdown.changed() => break SessionEnd::Shutdown,
                        }
                    };
                    self.connected.send_replace(false);

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Resubscribe => continue,
                        SessionEnd::Disconnected => {
                            lost = true;
                            tracing::warn!("fanout subscription lost, cross-instance delivery paused");
                        }
                    }
                }
                Err(e) => {
                    lost = true;
                    tracing::warn!(error = %e, attempt = backoff.attempts() + 1, "fanout subscribe failed");
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.connected.send_replace(false);
        tracing::info!("fanout bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<FanoutEvent>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &FanoutEvent) {
            self.events.lock().await.push(event.clone());
        }
    }

    fn config() -> FanoutConfig {
        FanoutConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            dedup_window: 16,
        }
    }

    fn typing(chat_id: Uuid) -> FanoutPayload {
        FanoutPayload::Typing {
            chat_id,
            user_id: Uuid::new_v4(),
        }
    }

    async fn wait_for_count(recorder: &Recorder, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.events.lock().await.len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("events not delivered in time");
    }

    #[test]
    fn recent_events_window_evicts_oldest() {
        let mut recent = RecentEvents::new(2);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(recent.insert(a));
        assert!(!recent.insert(a));
        assert!(recent.insert(b));
        assert!(recent.insert(c));
        assert!(recent.insert(a));
    }

    #[tokio::test]
    async fn local_delivery_survives_backbone_outage() {
        let backbone = MemoryBackbone::default();
        let bridge = FanoutBridge::new(Arc::new(backbone.clone()), Uuid::new_v4(), config());
        let recorder = Arc::new(Recorder::default());
        bridge.subscribe("chat:*", recorder.clone());

        backbone.set_available(false);
        let chat = Uuid::new_v4();
        assert!(bridge.publish(Topic::Chat(chat), typing(chat)).await.is_err());
        assert_eq!(recorder.events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn cross_instance_delivery_skips_own_events() {
        let backbone: Arc<dyn Backbone> = Arc::new(MemoryBackbone::default());
        let a = FanoutBridge::new(backbone.clone(), Uuid::new_v4(), config());
        let b = FanoutBridge::new(backbone.clone(), Uuid::new_v4(), config());
        let (ra, rb) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        a.subscribe("chat:*", ra.clone());
        b.subscribe("chat:*", rb.clone());

        let (_tx, shutdown) = watch::channel(false);
        tokio::spawn(a.clone().run(shutdown.clone()));
        tokio::spawn(b.clone().run(shutdown));
        a.wait_connected().await;
        b.wait_connected().await;

        let chat = Uuid::new_v4();
        let sent = a.publish(Topic::Chat(chat), typing(chat)).await.unwrap();

        wait_for_count(&rb, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ra.events.lock().await.len(), 1);
        assert_eq!(rb.events.lock().await[0].event_id, sent.event_id);
    }

    #[tokio::test]
    async fn reconnects_after_sever_and_dedups_replays() {
        let memory = MemoryBackbone::default();
        let backbone: Arc<dyn Backbone> = Arc::new(memory.clone());
        let bridge = FanoutBridge::new(backbone.clone(), Uuid::new_v4(), config());
        let recorder = Arc::new(Recorder::default());
        bridge.subscribe("presence:*", recorder.clone());

        let (tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(bridge.clone().run(shutdown));
        bridge.wait_connected().await;

        memory.sever();
        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.reconnect_count() == 0 || !bridge.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Same event delivered twice by a remote producer.
        let user = Uuid::new_v4();
        let remote = FanoutEvent::new(
            Topic::Presence(user),
            FanoutPayload::NotificationDeleted {
                notification_id: Uuid::new_v4(),
            },
            Uuid::new_v4(),
        );
        let encoded = serde_json::to_string(&remote).unwrap();
        let channel = Topic::Presence(user).channel();
        backbone.publish(&channel, encoded.clone()).await.unwrap();
        backbone.publish(&channel, encoded).await.unwrap();

        wait_for_count(&recorder, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.events.lock().await.len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn late_pattern_triggers_resubscribe() {
        let backbone: Arc<dyn Backbone> = Arc::new(MemoryBackbone::default());
        let listener = FanoutBridge::new(backbone.clone(), Uuid::new_v4(), config());
        let producer = FanoutBridge::new(backbone, Uuid::new_v4(), config());

        let (_tx, shutdown) = watch::channel(false);
        tokio::spawn(listener.clone().run(shutdown));

        let first = Arc::new(Recorder::default());
        listener.subscribe("chat:*", first.clone());
        listener.wait_connected().await;

        let second = Arc::new(Recorder::default());
        assert!(listener.subscribe("notifications:*", second.clone()));
        assert!(!listener.subscribe("notifications:*", second.clone()));

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let user = Uuid::new_v4();
                let _ = producer
                    .publish(
                        Topic::Notifications(user),
                        FanoutPayload::NotificationRead {
                            notification_ids: vec![],
                            all: true,
                        },
                    )
                    .await;
                if !second.events.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
