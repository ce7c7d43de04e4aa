use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::FanoutError;
use crate::topic::matches_pattern;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages for one subscription. It ending means the
/// subscription was lost and must be re-established.
pub type BackboneStream = BoxStream<'static, BackboneMessage>;

/// Publish/subscribe substrate shared by every instance.
#[async_trait]
pub trait Backbone: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FanoutError>;

    async fn subscribe(&self, patterns: &[String]) -> Result<BackboneStream, FanoutError>;
}

/// In-process backbone for single-node deployments and tests.
#[derive(Clone)]
pub struct MemoryBackbone {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    tx: broadcast::Sender<BackboneMessage>,
    epoch: watch::Sender<u64>,
    available: AtomicBool,
}

impl MemoryBackbone {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(MemoryInner {
                tx,
                epoch,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// End every live subscription, as a dropped backbone connection would.
    pub fn sever(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Simulate an outage: while unavailable, publish and subscribe fail.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            self.sever();
        }
    }

    fn check_available(&self) -> Result<(), FanoutError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FanoutError::Disconnected("memory backbone unavailable".into()))
        }
    }
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FanoutError> {
        self.check_available()?;
        // No subscribers is not an error.
        let _ = self.inner.tx.send(BackboneMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<BackboneStream, FanoutError> {
        self.check_available()?;

        let patterns = patterns.to_vec();
        let mut epoch = self.inner.epoch.subscribe();
        let severed = async move {
            let _ = epoch.changed().await;
        };

        let stream = BroadcastStream::new(self.inner.tx.subscribe())
            .filter_map(move |item| {
                let matched = match item {
                    Ok(msg) if patterns.iter().any(|p| matches_pattern(p, &msg.channel)) => {
                        Some(msg)
                    }
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory backbone subscriber lagged");
                        None
                    }
                };
                future::ready(matched)
            })
            .take_until(severed);

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pattern_filtered_delivery() {
        let backbone = MemoryBackbone::default();
        let mut chats = backbone.subscribe(&["chat:*".to_string()]).await.unwrap();

        backbone.publish("presence:1", "p".into()).await.unwrap();
        backbone.publish("chat:1", "c".into()).await.unwrap();

        let msg = chats.next().await.unwrap();
        assert_eq!(msg.channel, "chat:1");
        assert_eq!(msg.payload, "c");
    }

    #[tokio::test]
    async fn sever_ends_live_subscriptions_only() {
        let backbone = MemoryBackbone::default();
        let mut before = backbone.subscribe(&["*".to_string()]).await.unwrap();
        backbone.sever();
        assert!(before.next().await.is_none());

        let mut after = backbone.subscribe(&["*".to_string()]).await.unwrap();
        backbone.publish("chat:2", "x".into()).await.unwrap();
        assert_eq!(after.next().await.unwrap().payload, "x");
    }

    #[tokio::test]
    async fn unavailable_backbone_rejects_calls() {
        let backbone = MemoryBackbone::default();
        backbone.set_available(false);
        assert!(backbone.publish("chat:1", "x".into()).await.is_err());
        assert!(backbone.subscribe(&["*".to_string()]).await.is_err());

        backbone.set_available(true);
        assert!(backbone.publish("chat:1", "x".into()).await.is_ok());
    }
}
