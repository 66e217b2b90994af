use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub rust_log: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub live_ttl_secs: u64,
    pub completed_ttl_secs: u64,
    pub leaderboard_ttl_secs: u64,
    pub grace_secs: u64,
    pub hot_hits: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            live_ttl_secs: 10,
            completed_ttl_secs: 600,
            leaderboard_ttl_secs: 30,
            grace_secs: 60,
            hot_hits: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub timeout_ms: u64,
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcilerConfig {
    pub match_duration_secs: i64,
    pub poll_interval_secs: u64,
    /// First block the event feed reads from.
    pub events_from_block: u64,
}

impl ReconcilerConfig {
    pub fn match_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.match_duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            match_duration_secs: 60,
            poll_interval_secs: 5,
            events_from_block: 0,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T, anyhow::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let rpc_url = env::var("LEDGER_RPC_URL")?;
        let contract_address = env::var("CLASH_CONTRACT_ADDRESS")?;
        let request_timeout_ms = env_or("LEDGER_TIMEOUT_MS", 10_000)?;
        let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.is_empty());
        let port: u16 = env::var("PORT")?.parse()?;
        let host = env::var("HOST")?;
        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let cache_defaults = CacheConfig::default();
        let queue_defaults = QueueConfig::default();
        let retry_defaults = RetryConfig::default();
        let reconciler_defaults = ReconcilerConfig::default();

        Ok(Config {
            ledger: LedgerConfig {
                rpc_url,
                contract_address,
                request_timeout_ms,
            },
            redis: RedisConfig { url: redis_url },
            server: ServerConfig {
                port,
                host,
                rust_log,
            },
            cache: CacheConfig {
                live_ttl_secs: env_or("CACHE_LIVE_TTL_SECS", cache_defaults.live_ttl_secs)?,
                completed_ttl_secs: env_or(
                    "CACHE_COMPLETED_TTL_SECS",
                    cache_defaults.completed_ttl_secs,
                )?,
                leaderboard_ttl_secs: env_or(
                    "CACHE_LEADERBOARD_TTL_SECS",
                    cache_defaults.leaderboard_ttl_secs,
                )?,
                grace_secs: env_or("CACHE_GRACE_SECS", cache_defaults.grace_secs)?,
                hot_hits: env_or("CACHE_HOT_HITS", cache_defaults.hot_hits)?,
            },
            queue: QueueConfig {
                max_concurrent: env_or("QUEUE_MAX_CONCURRENT", queue_defaults.max_concurrent)?,
                timeout_ms: env_or("QUEUE_TIMEOUT_MS", queue_defaults.timeout_ms)?,
            },
            retry: RetryConfig {
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
                jitter_ms: env_or("RETRY_JITTER_MS", retry_defaults.jitter_ms)?,
            },
            reconciler: ReconcilerConfig {
                match_duration_secs: env_or(
                    "MATCH_DURATION_SECS",
                    reconciler_defaults.match_duration_secs,
                )?,
                poll_interval_secs: env_or(
                    "POLL_INTERVAL_SECS",
                    reconciler_defaults.poll_interval_secs,
                )?,
                events_from_block: env_or(
                    "EVENTS_FROM_BLOCK",
                    reconciler_defaults.events_from_block,
                )?,
            },
        })
    }
}
