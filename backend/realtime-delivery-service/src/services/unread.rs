use moka::future::Cache;
use std::time::Duration;
use uuid::Uuid;

use crate::store::{ChatStore, StoreError};

/// Short-TTL cache of unread counts keyed by (chat, user).
///
/// Entries for a chat are invalidated whenever a message or read receipt
/// for it passes through this instance, so staleness is bounded by the TTL
/// only when an event is lost.
#[derive(Clone)]
pub struct UnreadCache {
    inner: Option<Cache<(Uuid, Uuid), i64>>,
}

impl UnreadCache {
    /// A zero `ttl` disables caching.
    pub fn new(ttl: Duration) -> Self {
        let inner = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl)
                .support_invalidation_closures()
                .build()
        });
        Self { inner }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub async fn get_or_count(
        &self,
        store: &dyn ChatStore,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<i64, StoreError> {
        let Some(cache) = &self.inner else {
            return store.count_unread(chat_id, user_id).await;
        };

        if let Some(count) = cache.get(&(chat_id, user_id)).await {
            return Ok(count);
        }
        let count = store.count_unread(chat_id, user_id).await?;
        cache.insert((chat_id, user_id), count).await;
        Ok(count)
    }

    pub async fn invalidate(&self, chat_id: Uuid, user_id: Uuid) {
        if let Some(cache) = &self.inner {
            cache.invalidate(&(chat_id, user_id)).await;
        }
    }

    pub fn invalidate_chat(&self, chat_id: Uuid) {
        if let Some(cache) = &self.inner {
            if let Err(e) = cache.invalidate_entries_if(move |key: &(Uuid, Uuid), _| key.0 == chat_id) {
                tracing::warn!(chat_id = %chat_id, error = %e, "unread cache invalidation failed");
                cache.invalidate_all();
            }
        }
    }
}
