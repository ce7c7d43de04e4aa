use async_trait::async_trait;
use futures::{future, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::backbone::{Backbone, BackboneMessage, BackboneStream};
use super::FanoutError;

/// Redis pub/sub backbone.
///
/// Publishing goes through a shared `ConnectionManager`, which reconnects on
/// its own; each subscription holds a dedicated pub/sub connection whose
/// message stream ends when that connection drops.
#[derive(Clone)]
pub struct RedisBackbone {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBackbone {
    pub async fn connect(redis_url: &str) -> Result<Self, FanoutError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        tracing::info!("connected fanout backbone to redis");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FanoutError> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<BackboneStream, FanoutError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let message = match msg.get_payload::<String>() {
                Ok(payload) => Some(BackboneMessage { channel, payload }),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "dropping non-utf8 backbone payload");
                    None
                }
            };
            future::ready(message)
        });

        Ok(stream.boxed())
    }
}
