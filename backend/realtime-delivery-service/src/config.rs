use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Number of registry shards, always a power of two
    pub shard_count: usize,
    /// Outbound frames buffered per connection before it is dropped
    pub outbound_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            shard_count: 64,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    /// Online -> Away after this long without activity
    pub idle_timeout: Duration,
    /// Any -> Offline after this long without a heartbeat
    pub hard_timeout: Duration,
    /// Directory entries older than this are ignored
    pub stale_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(30);
        Self {
            heartbeat_interval,
            idle_timeout: Duration::from_secs(300),
            hard_timeout: Duration::from_secs(90),
            stale_after: heartbeat_interval * 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Number of recent event ids remembered for deduplication
    pub dedup_window: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            dedup_window: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
    /// Counter store calls slower than this are treated as a backend failure
    pub redis_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window_seconds: 60,
            redis_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub keepalive_interval: Duration,
    pub buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            buffer: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub instance_id: Uuid,
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub internal_service_token: String,
    pub registry: RegistryConfig,
    pub presence: PresenceConfig,
    pub fanout: FanoutConfig,
    pub rate_limit: RateLimitConfig,
    pub stream: StreamConfig,
    /// Zero disables the unread-count cache
    pub unread_cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let jwt_secret = required("JWT_SECRET")?;
        let internal_service_token = required("INTERNAL_SERVICE_TOKEN")?;
        let database_url = optional("DATABASE_URL");
        let redis_url = optional("REDIS_URL");
        let db_max_connections = parse_or::<usize>("DB_MAX_CONNECTIONS", 10)?.max(1);
        let port = parse_or("PORT", 8085u16)?;

        let shard_count: usize = parse_or("REGISTRY_SHARDS", 64)?;
        let registry = RegistryConfig {
            shard_count: shard_count.max(2).next_power_of_two(),
            outbound_buffer: parse_or::<usize>("WS_OUTBOUND_BUFFER", 256)?.max(1),
        };

        let heartbeat_interval = Duration::from_secs(parse_or("PRESENCE_HEARTBEAT_SECS", 30)?);
        let presence = PresenceConfig {
            heartbeat_interval,
            idle_timeout: Duration::from_secs(parse_or("PRESENCE_IDLE_SECS", 300)?),
            hard_timeout: Duration::from_secs(parse_or("PRESENCE_HARD_TIMEOUT_SECS", 90)?),
            stale_after: heartbeat_interval * 3,
        };
        if presence.hard_timeout <= presence.heartbeat_interval {
            return Err(AppError::Config(
                "PRESENCE_HARD_TIMEOUT_SECS must exceed PRESENCE_HEARTBEAT_SECS".into(),
            ));
        }

        let fanout = FanoutConfig {
            initial_backoff: Duration::from_millis(parse_or("FANOUT_INITIAL_BACKOFF_MS", 100)?),
            max_backoff: Duration::from_millis(parse_or("FANOUT_MAX_BACKOFF_MS", 30_000)?),
            dedup_window: parse_or("FANOUT_DEDUP_WINDOW", 1024)?,
        };

        let rate_limit = RateLimitConfig {
            max_requests: parse_or("RATE_LIMIT_MAX_REQUESTS", 120)?,
            window_seconds: parse_or::<u64>("RATE_LIMIT_WINDOW_SECS", 60)?.max(1),
            redis_timeout_ms: parse_or("RATE_LIMIT_REDIS_TIMEOUT_MS", 100)?,
        };

        let stream = StreamConfig {
            keepalive_interval: Duration::from_secs(parse_or("SSE_KEEPALIVE_SECS", 15)?.max(1)),
            buffer: parse_or::<usize>("SSE_BUFFER", 64)?.max(1),
        };

        let unread_cache_ttl = Duration::from_millis(parse_or("UNREAD_CACHE_TTL_MS", 2000)?);

        Ok(Self {
            instance_id: Uuid::new_v4(),
            port,
            database_url,
            db_max_connections,
            redis_url,
            jwt_secret,
            internal_service_token,
            registry,
            presence,
            fanout,
            rate_limit,
            stream,
            unread_cache_ttl,
        })
    }

    /// Defaults suitable for a single in-process node; tests build on this.
    pub fn for_local(jwt_secret: &str, internal_service_token: &str) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            port: 8085,
            database_url: None,
            db_max_connections: 10,
            redis_url: None,
            jwt_secret: jwt_secret.to_string(),
            internal_service_token: internal_service_token.to_string(),
            registry: RegistryConfig::default(),
            presence: PresenceConfig::default(),
            fanout: FanoutConfig::default(),
            rate_limit: RateLimitConfig::default(),
            stream: StreamConfig::default(),
            unread_cache_ttl: Duration::from_millis(2000),
        }
    }
}

fn required(key: &str) -> Result<String, AppError> {
    optional(key).ok_or_else(|| AppError::Config(format!("{key} missing")))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "JWT_SECRET",
        "INTERNAL_SERVICE_TOKEN",
        "DATABASE_URL",
        "REDIS_URL",
        "PORT",
        "REGISTRY_SHARDS",
        "PRESENCE_HEARTBEAT_SECS",
        "PRESENCE_HARD_TIMEOUT_SECS",
        "RATE_LIMIT_MAX_REQUESTS",
        "UNREAD_CACHE_TTL_MS",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_when_only_secrets_are_set() {
        clear_env();
        env::set_var("JWT_SECRET", "secret");
        env::set_var("INTERNAL_SERVICE_TOKEN", "internal");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8085);
        assert!(cfg.database_url.is_none());
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.registry.shard_count, 64);
        assert_eq!(cfg.presence.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.presence.stale_after, Duration::from_secs(90));
        assert_eq!(cfg.fanout.initial_backoff, Duration::from_millis(100));
        assert_eq!(cfg.rate_limit.max_requests, 120);
        clear_env();
    }

    #[test]
    #[serial]
    fn missing_secret_is_a_config_error() {
        clear_env();
        env::set_var("INTERNAL_SERVICE_TOKEN", "internal");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("JWT_SECRET")));
        clear_env();
    }

    #[test]
    #[serial]
    fn shard_count_rounds_up_and_bad_numbers_fail() {
        clear_env();
        env::set_var("JWT_SECRET", "secret");
        env::set_var("INTERNAL_SERVICE_TOKEN", "internal");
        env::set_var("REGISTRY_SHARDS", "20");
        assert_eq!(Config::from_env().unwrap().registry.shard_count, 32);

        env::set_var("PORT", "eighty");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));
        clear_env();
    }

    #[test]
    #[serial]
    fn hard_timeout_must_exceed_heartbeat() {
        clear_env();
        env::set_var("JWT_SECRET", "secret");
        env::set_var("INTERNAL_SERVICE_TOKEN", "internal");
        env::set_var("PRESENCE_HEARTBEAT_SECS", "60");
        env::set_var("PRESENCE_HARD_TIMEOUT_SECS", "30");
        assert!(matches!(Config::from_env(), Err(AppError::Config(_))));
        clear_env();
    }
}
