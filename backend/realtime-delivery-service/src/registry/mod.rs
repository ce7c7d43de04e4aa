//! Per-process connection registry.
//!
//! Maps topics to the live connections this instance holds. Topics are
//! spread over independently locked shards so unrelated chats and users
//! never contend, and each connection owns a bounded outbound buffer: a
//! consumer that cannot keep up is closed instead of stalling delivery.

pub mod handle;

pub use handle::{channel, CloseReason, ConnectionHandle, Frame, Outbound, OutboundReceiver};

use chrono::Utc;
use dashmap::DashMap;
use handle::PushError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::metrics;
use crate::topic::Topic;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection handle is already closed")]
    HandleClosed,
}

/// Unique identifier for one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    id: ConnectionId,
    user_id: Uuid,
    topic: Topic,
    handle: ConnectionHandle,
    last_activity_ms: AtomicI64,
}

impl ConnectionEntry {
    fn idle_for(&self, now_ms: i64) -> Duration {
        let idle = now_ms - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle.max(0) as u64)
    }
}

#[derive(Debug)]
struct RegistryInner {
    topics: DashMap<Topic, Vec<Arc<ConnectionEntry>>>,
    index: DashMap<ConnectionId, Arc<ConnectionEntry>>,
}

/// Constructed once per process and shared by cloning.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let shards = config.shard_count.max(2).next_power_of_two();
        Self {
            inner: Arc::new(RegistryInner {
                topics: DashMap::with_shard_amount(shards),
                index: DashMap::with_shard_amount(shards),
            }),
        }
    }

    /// Add a connection under `topic`. Fails if the handle is already closed.
    pub fn register(
        &self,
        user_id: Uuid,
        topic: Topic,
        handle: ConnectionHandle,
    ) -> Result<ConnectionId, RegistryError> {
        if handle.is_closed() {
            return Err(RegistryError::HandleClosed);
        }

        let entry = Arc::new(ConnectionEntry {
            id: ConnectionId::new(),
            user_id,
            topic,
            handle,
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        let id = entry.id;

        // Index first: a delivery that drops this entry must find it here.
        self.inner.index.insert(id, entry.clone());
        self.inner.topics.entry(topic).or_default().push(entry);
        metrics::ACTIVE_CONNECTIONS.inc();

        tracing::debug!(connection_id = %id, user_id = %user_id, topic = %topic, "connection registered");
        Ok(id)
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let Some((_, entry)) = self.inner.index.remove(&id) else {
            return false;
        };
        metrics::ACTIVE_CONNECTIONS.dec();

        if let Some(mut entries) = self.inner.topics.get_mut(&entry.topic) {
            entries.retain(|e| e.id != id);
        }
        self.inner
            .topics
            .remove_if(&entry.topic, |_, entries| entries.is_empty());

        tracing::debug!(connection_id = %id, user_id = %entry.user_id, topic = %entry.topic, "connection unregistered");
        true
    }

    /// Enqueue `payload` on every local connection of `topic` without
    /// waiting. Connections whose buffer is full are force-closed and
    /// removed; the rest still receive the frame.
    pub fn deliver_local(&self, topic: &Topic, payload: Frame) -> usize {
        let mut dropped = Vec::new();
        let mut delivered = 0;

        if let Some(mut entries) = self.inner.topics.get_mut(topic) {
            entries.retain(|entry| {
                if entry.handle.is_closed() {
                    dropped.push(entry.id);
                    return false;
                }
                match entry.handle.try_push(payload.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(PushError::Full) => {
                        tracing::warn!(
                            connection_id = %entry.id,
                            user_id = %entry.user_id,
                            topic = %topic,
                            "outbound buffer full, closing slow consumer"
                        );
                        entry.handle.close(CloseReason::SlowConsumer);
                        metrics::SLOW_CONSUMERS_DROPPED.inc();
                        dropped.push(entry.id);
                        false
                    }
                    Err(PushError::Closed) => {
                        dropped.push(entry.id);
                        false
                    }
                }
            });
        }

        if !dropped.is_empty() {
            self.inner
                .topics
                .remove_if(topic, |_, entries| entries.is_empty());
            for id in dropped {
                if self.inner.index.remove(&id).is_some() {
                    metrics::ACTIVE_CONNECTIONS.dec();
                }
            }
        }

        delivered
    }

    /// Record activity on a connection.
    pub fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.index.get(&id) {
            entry
                .last_activity_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    /// Force-close every connection idle longer than `max_idle`.
    pub fn close_idle(&self, max_idle: Duration) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let idle: Vec<ConnectionId> = self
            .inner
            .index
            .iter()
            .filter(|entry| entry.idle_for(now_ms) > max_idle)
            .map(|entry| *entry.key())
            .collect();

        self.close_ids(idle, CloseReason::IdleTimeout)
    }

    /// Force-close everything, used on shutdown.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let all: Vec<ConnectionId> = self.inner.index.iter().map(|e| *e.key()).collect();
        self.close_ids(all, reason)
    }

    fn close_ids(&self, ids: Vec<ConnectionId>, reason: CloseReason) -> usize {
        let mut closed = 0;
        for id in ids {
            let handle = self.inner.index.get(&id).map(|e| e.handle.clone());
            if let Some(handle) = handle {
                handle.close(reason);
                if self.unregister(id) {
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            tracing::info!(closed, reason = reason.description(), "closed connections");
        }
        closed
    }

    pub fn connection_count(&self) -> usize {
        self.inner.index.len()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.topics.get(topic).map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.inner.index.contains_key(&id)
    }
}
