use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Config;
use crate::error::AppError;
use crate::fanout::{Backbone, FanoutBridge, MemoryBackbone, RedisBackbone};
use crate::middleware::JwtValidator;
use crate::presence::publisher::{run_publisher, run_republisher};
use crate::presence::{PresenceDirectory, PresenceTracker};
use crate::rate_limit::{MemoryRateLimitStore, RateLimitStore, RateLimiter, RedisRateLimitStore};
use crate::registry::{CloseReason, ConnectionRegistry};
use crate::services::{ChatService, MessageService, NotificationService, UnreadCache};
use crate::sse::StreamBroadcaster;
use crate::store::{ChatStore, MemoryStore, PgStore};
use crate::topic::{CHAT_PATTERN, NOTIFICATIONS_PATTERN, PRESENCE_PATTERN};
use crate::websocket::{ChatFanoutHandler, PresenceFanoutHandler};
use resilience::{with_retry, RetryConfig};

const MEMORY_BACKBONE_CAPACITY: usize = 4096;

/// External systems the service talks to.
pub struct Backends {
    pub store: Arc<dyn ChatStore>,
    pub backbone: Arc<dyn Backbone>,
    pub rate_limits: Arc<dyn RateLimitStore>,
}

impl Backends {
    /// Everything in-process: a single-node deployment.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            backbone: Arc::new(MemoryBackbone::new(MEMORY_BACKBONE_CAPACITY)),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
        }
    }

    /// Connect to PostgreSQL and Redis when configured, falling back to the
    /// in-process implementations otherwise.
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        let store: Arc<dyn ChatStore> = match &config.database_url {
            Some(url) => {
                let max = config.db_max_connections;
                let store = with_retry("postgres connect", RetryConfig::default(), || {
                    PgStore::connect(url, max)
                })
                .await
                .map_err(|e| AppError::StartServer(e.to_string()))?;
                Arc::new(store)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let (backbone, rate_limits): (Arc<dyn Backbone>, Arc<dyn RateLimitStore>) =
            match &config.redis_url {
                Some(url) => {
                    let backbone = with_retry("redis connect", RetryConfig::default(), || {
                        RedisBackbone::connect(url)
                    })
                    .await
                    .map_err(|e| AppError::StartServer(e.to_string()))?;
                    let limits = with_retry("redis rate limit connect", RetryConfig::default(), || {
                        RedisRateLimitStore::connect(url)
                    })
                    .await
                    .map_err(|e| AppError::StartServer(e.to_string()))?;
                    (Arc::new(backbone), Arc::new(limits))
                }
                None => {
                    tracing::warn!("REDIS_URL not set, fanout and rate limits are process-local");
                    (
                        Arc::new(MemoryBackbone::new(MEMORY_BACKBONE_CAPACITY)),
                        Arc::new(MemoryRateLimitStore::new()),
                    )
                }
            };

        Ok(Self {
            store,
            backbone,
            rate_limits,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChatStore>,
    pub registry: ConnectionRegistry,
    pub presence: Arc<PresenceTracker>,
    pub directory: Arc<PresenceDirectory>,
    pub bridge: Arc<FanoutBridge>,
    pub messages: MessageService,
    pub chats: ChatService,
    pub notifications: NotificationService,
    pub streams: StreamBroadcaster,
    pub rate_limiter: RateLimiter,
    pub auth: Arc<JwtValidator>,
}

impl AppState {
    /// Wire components, subscribe the fanout handlers and spawn background
    /// tasks. Tasks stop when `shutdown` flips to true.
    pub fn start(config: Config, backends: Backends, shutdown: watch::Receiver<bool>) -> Self {
        let config = Arc::new(config);
        let registry = ConnectionRegistry::new(&config.registry);
        let (presence, presence_changes) = PresenceTracker::new(config.instance_id, &config.presence);
        let directory = Arc::new(PresenceDirectory::new(config.presence.stale_after));
        let bridge = FanoutBridge::new(backends.backbone, config.instance_id, config.fanout.clone());
        let unread = UnreadCache::new(config.unread_cache_ttl);
        let streams = StreamBroadcaster::new(registry.clone(), presence.clone(), config.stream.clone());

        bridge.subscribe(
            CHAT_PATTERN,
            Arc::new(ChatFanoutHandler::new(registry.clone(), unread.clone())),
        );
        bridge.subscribe(
            PRESENCE_PATTERN,
            Arc::new(PresenceFanoutHandler::new(registry.clone(), directory.clone())),
        );
        bridge.subscribe(NOTIFICATIONS_PATTERN, Arc::new(streams.clone()));

        tokio::spawn(bridge.clone().run(shutdown.clone()));
        tokio::spawn(run_publisher(presence_changes, bridge.clone()));
        tokio::spawn(run_republisher(
            presence.clone(),
            directory.clone(),
            config.presence.heartbeat_interval,
            shutdown.clone(),
        ));
        tokio::spawn(run_janitor(
            registry.clone(),
            config.presence.heartbeat_interval,
            config.presence.hard_timeout,
            shutdown,
        ));

        tracing::info!(instance_id = %config.instance_id, "realtime delivery state started");

        Self {
            messages: MessageService::new(backends.store.clone(), bridge.clone(), unread.clone()),
            chats: ChatService::new(backends.store.clone(), unread),
            notifications: NotificationService::new(backends.store.clone(), bridge.clone()),
            rate_limiter: RateLimiter::new(backends.rate_limits, config.rate_limit.clone()),
            auth: Arc::new(JwtValidator::new(&config.jwt_secret)),
            store: backends.store,
            registry,
            presence,
            directory,
            bridge,
            streams,
            config,
        }
    }

    /// Close every local connection. Returns how many were open.
    pub fn close_connections(&self) -> usize {
        self.registry.close_all(CloseReason::Shutdown)
    }
}

/// Force-close connections that have been silent past the hard timeout.
async fn run_janitor(
    registry: ConnectionRegistry,
    every: std::time::Duration,
    max_idle: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let closed = registry.close_idle(max_idle);
                if closed > 0 {
                    tracing::info!(closed, "closed idle connections");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
