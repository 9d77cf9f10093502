pub mod loader;
pub mod validator;
pub mod watcher;

use crate::events::PartitionStrategy;
use crate::server::ServerConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Complete configuration of the check service (environment variables only)
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,

    pub backend: DistributedBackend,

    /// Shared store; only used when `backend` is Redis
    pub redis: RedisConfig,

    pub policy: PolicySyncConfig,

    pub local: LocalBucketConfig,

    pub events: EventsConfig,
}

/// Read an environment variable, falling back to `default` when it is unset
/// or does not parse.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparseable {}={:?}, using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

/// Where the authoritative buckets live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedBackend {
    Redis,
    /// Single node; buckets are only shared within this process
    Memory,
}

impl FromStr for DistributedBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(DistributedBackend::Redis),
            "memory" => Ok(DistributedBackend::Memory),
            other => Err(format!("unknown distributed backend '{}'", other)),
        }
    }
}

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// e.g. "redis://localhost:6379"
    pub url: String,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Pool wait/create timeout in seconds
    pub connection_timeout_secs: u64,

    /// Bound on one atomic bucket operation
    pub command_timeout_ms: u64,

    /// Lifetime of an idempotency marker
    pub idempotency_ttl_secs: u64,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env_string("REDIS_URL", &defaults.url),
            max_connections: env_or("REDIS_MAX_CONN", defaults.max_connections),
            connection_timeout_secs: env_or(
                "REDIS_CONNECT_TIMEOUT_SECS",
                defaults.connection_timeout_secs,
            ),
            command_timeout_ms: env_or("REDIS_COMMAND_TIMEOUT_MS", defaults.command_timeout_ms),
            idempotency_ttl_secs: env_or("IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl_secs),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connection_timeout_secs: 5,
            command_timeout_ms: 200,
            idempotency_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySourceKind {
    Http,
    File,
}

impl FromStr for PolicySourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(PolicySourceKind::Http),
            "file" => Ok(PolicySourceKind::File),
            other => Err(format!("unknown policy source '{}'", other)),
        }
    }
}

/// How the policy cache is kept in step with the system of record
#[derive(Debug, Clone)]
pub struct PolicySyncConfig {
    pub source: PolicySourceKind,

    /// Base URL of the control plane (http source)
    pub control_plane_url: String,

    /// JSON array of policies (file source)
    pub file: PathBuf,

    pub sync_interval_secs: u64,

    pub fetch_timeout_secs: u64,

    /// Resync as soon as the policy file changes
    pub watch_file: bool,
}

impl PolicySyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            source: env_or("POLICY_SOURCE", defaults.source),
            control_plane_url: env_string("CONTROL_PLANE_URL", &defaults.control_plane_url),
            file: std::env::var("POLICY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.file),
            sync_interval_secs: env_or("POLICY_SYNC_INTERVAL_SECS", defaults.sync_interval_secs),
            fetch_timeout_secs: env_or("POLICY_FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
            watch_file: env_flag("POLICY_WATCH_FILE", defaults.watch_file),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for PolicySyncConfig {
    fn default() -> Self {
        Self {
            source: PolicySourceKind::Http,
            control_plane_url: "http://localhost:8081".to_string(),
            file: PathBuf::from("config/policies.json"),
            sync_interval_secs: 30,
            fetch_timeout_secs: 5,
            watch_file: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalBucketConfig {
    /// Upper bound on local buckets before least-recently-used eviction
    pub max_buckets: usize,
}

impl LocalBucketConfig {
    pub fn from_env() -> Self {
        Self {
            max_buckets: env_or("LOCAL_MAX_BUCKETS", Self::default().max_buckets),
        }
    }
}

impl Default for LocalBucketConfig {
    fn default() -> Self {
        Self {
            max_buckets: 100_000,
        }
    }
}

/// Event stream settings for the check service
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Unset means events are logged instead of streamed
    pub brokers: Option<String>,

    pub topic: String,

    pub partition_strategy: PartitionStrategy,

    /// Time slice of the hybrid strategy
    pub time_slice_secs: u64,

    pub delivery_timeout_ms: u64,
}

impl EventsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            brokers: std::env::var("KAFKA_BROKERS")
                .ok()
                .filter(|b| !b.trim().is_empty()),
            topic: env_string("KAFKA_TOPIC", &defaults.topic),
            partition_strategy: env_or("PARTITION_STRATEGY", defaults.partition_strategy),
            time_slice_secs: env_or("PARTITION_TIME_SLICE_SECS", defaults.time_slice_secs),
            delivery_timeout_ms: env_or("KAFKA_DELIVERY_TIMEOUT_MS", defaults.delivery_timeout_ms),
        }
    }

    pub fn time_slice_millis(&self) -> i64 {
        (self.time_slice_secs as i64).saturating_mul(1000)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            brokers: None,
            topic: "quota-events".to_string(),
            partition_strategy: PartitionStrategy::TenantHash,
            time_slice_secs: 60,
            delivery_timeout_ms: 5000,
        }
    }
}

/// Configuration of the audit consumer binary
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub database_url: String,

    pub brokers: String,

    pub topic: String,

    pub group_id: String,

    /// Parallel consumers in the group
    pub consumers: usize,

    /// Max events per batch
    pub batch_size: usize,

    /// How long a batch may wait to fill
    pub batch_wait_ms: u64,
}

impl AuditConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("AUDIT_DATABASE_URL", &defaults.database_url),
            brokers: env_string("KAFKA_BROKERS", &defaults.brokers),
            topic: env_string("KAFKA_TOPIC", &defaults.topic),
            group_id: env_string("AUDIT_GROUP_ID", &defaults.group_id),
            consumers: env_or("AUDIT_CONSUMERS", defaults.consumers),
            batch_size: env_or("AUDIT_BATCH_SIZE", defaults.batch_size),
            batch_wait_ms: env_or("AUDIT_BATCH_WAIT_MS", defaults.batch_wait_ms),
        }
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit.db".to_string(),
            brokers: "localhost:9092".to_string(),
            topic: "quota-events".to_string(),
            group_id: "accounting-service".to_string(),
            consumers: 3,
            batch_size: 500,
            batch_wait_ms: 300,
        }
    }
}
