#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use realtime_delivery_service::config::Config;
use realtime_delivery_service::fanout::MemoryBackbone;
use realtime_delivery_service::rate_limit::MemoryRateLimitStore;
use realtime_delivery_service::registry::{channel, ConnectionId, Outbound, OutboundReceiver};
use realtime_delivery_service::state::{AppState, Backends};
use realtime_delivery_service::store::MemoryStore;
use realtime_delivery_service::topic::Topic;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

pub const JWT_SECRET: &str = "integration-secret";
pub const INTERNAL_TOKEN: &str = "integration-internal-token";

/// Instances sharing one store and one backbone, like a deployment behind a
/// load balancer.
pub struct Cluster {
    pub store: Arc<MemoryStore>,
    pub backbone: MemoryBackbone,
    pub nodes: Vec<AppState>,
    _shutdown: watch::Sender<bool>,
}

pub fn config() -> Config {
    let mut config = Config::for_local(JWT_SECRET, INTERNAL_TOKEN);
    config.fanout.initial_backoff = Duration::from_millis(10);
    config.fanout.max_backoff = Duration::from_millis(50);
    config
}

impl Cluster {
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, config).await
    }

    pub async fn start_with(size: usize, make_config: impl Fn() -> Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backbone = MemoryBackbone::new(1024);
        let rate_limits = Arc::new(MemoryRateLimitStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut nodes = Vec::with_capacity(size);
        for _ in 0..size {
            let backends = Backends {
                store: store.clone(),
                backbone: Arc::new(backbone.clone()),
                rate_limits: rate_limits.clone(),
            };
            let node = AppState::start(make_config(), backends, shutdown_rx.clone());
            nodes.push(node);
        }
        for node in &nodes {
            tokio::time::timeout(Duration::from_secs(2), node.bridge.wait_connected())
                .await
                .expect("bridge never connected");
        }

        Self {
            store,
            backbone,
            nodes,
            _shutdown: shutdown_tx,
        }
    }

    pub fn node(&self, index: usize) -> &AppState {
        &self.nodes[index]
    }
}

/// Register a raw connection, standing in for a socket on `node`.
pub fn listen(
    node: &AppState,
    user_id: Uuid,
    topic: Topic,
    capacity: usize,
) -> (ConnectionId, OutboundReceiver) {
    let (handle, rx) = channel(capacity);
    let id = node
        .registry
        .register(user_id, topic, handle)
        .expect("register connection");
    (id, rx)
}

/// Next frame as JSON, failing the test after `within`.
pub async fn next_json(rx: &mut OutboundReceiver, within: Duration) -> Value {
    match tokio::time::timeout(within, rx.recv()).await {
        Ok(Outbound::Frame(frame)) => serde_json::from_str(&frame).expect("frame is json"),
        Ok(Outbound::Closed(reason)) => panic!("connection closed: {reason:?}"),
        Err(_) => panic!("no frame within {within:?}"),
    }
}

/// Skip frames until one of `kind` arrives.
pub async fn next_of_type(rx: &mut OutboundReceiver, kind: &str, within: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = next_json(rx, remaining).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}
