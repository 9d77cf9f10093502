use crate::config::validator::{validate_audit_config, validate_config};
use crate::config::{
    AppConfig, AuditConfig, DistributedBackend, EventsConfig, LocalBucketConfig, PolicySourceKind,
    PolicySyncConfig, RedisConfig,
};
use crate::errors::Result;
use crate::server::ServerConfig;
use tracing::{debug, info};

/// Load the check-service configuration from environment variables
pub fn load_config() -> Result<AppConfig> {
    info!("Loading application configuration...");

    let backend = std::env::var("DISTRIBUTED_BACKEND")
        .ok()
        .map(|v| v.parse::<DistributedBackend>())
        .transpose()
        .map_err(crate::errors::QuotaError::ConfigurationError)?
        .unwrap_or(DistributedBackend::Redis);

    let app_config = AppConfig {
        server: ServerConfig::from_env(),
        backend,
        redis: RedisConfig::from_env(),
        policy: PolicySyncConfig::from_env(),
        local: LocalBucketConfig::from_env(),
        events: EventsConfig::from_env(),
    };

    validate_config(&app_config)?;

    info!("Application configuration loaded and validated successfully");
    log_config_summary(&app_config);

    Ok(app_config)
}

/// Load the audit consumer configuration from environment variables
pub fn load_audit_config() -> Result<AuditConfig> {
    let config = AuditConfig::from_env();
    validate_audit_config(&config)?;

    info!("=== Audit Configuration ===");
    info!("Database: {}", mask_password(&config.database_url));
    info!("Brokers: {}", config.brokers);
    info!("Topic: {} (group: {})", config.topic, config.group_id);
    info!(
        "Consumers: {}, batch size: {}, batch wait: {}ms",
        config.consumers, config.batch_size, config.batch_wait_ms
    );
    info!("===========================");

    Ok(config)
}

/// Log a summary of the loaded configuration
fn log_config_summary(config: &AppConfig) {
    info!("=== Configuration Summary ===");
    info!("HTTP: {}", config.server.addr());

    match config.backend {
        DistributedBackend::Redis => log_redis_config_summary(&config.redis),
        DistributedBackend::Memory => info!("Distributed tier: in-process"),
    }

    match config.policy.source {
        PolicySourceKind::Http => info!(
            "Policy source: {} (every {}s, timeout {}s)",
            mask_password(&config.policy.control_plane_url),
            config.policy.sync_interval_secs,
            config.policy.fetch_timeout_secs
        ),
        PolicySourceKind::File => info!(
            "Policy source: {} (every {}s, watch: {})",
            config.policy.file.display(),
            config.policy.sync_interval_secs,
            config.policy.watch_file
        ),
    }

    info!("Local buckets: up to {}", config.local.max_buckets);

    match &config.events.brokers {
        Some(brokers) => info!(
            "Events: {} -> {} (partitioning: {})",
            brokers,
            config.events.topic,
            config.events.partition_strategy.as_str()
        ),
        None => info!("Events: log only"),
    }

    info!("=============================");
}

/// Log a summary of Redis config only (masks password)
fn log_redis_config_summary(config: &RedisConfig) {
    let redis_url_safe = mask_password(&config.url);
    info!("Redis URL: {}", redis_url_safe);
    info!("Redis Max Connections: {}", config.max_connections);
    info!("Redis Connection Timeout: {}s", config.connection_timeout_secs);
    info!("Redis Command Timeout: {}ms", config.command_timeout_ms);
    debug!("Idempotency TTL: {}s", config.idempotency_ttl_secs);
}

/// Mask password in a connection URL for safe logging
fn mask_password(url: &str) -> String {
    let authority_start = url.find("://").map(|i| i + 3).unwrap_or(0);
    if let Some(at_offset) = url[authority_start..].rfind('@') {
        let at_pos = authority_start + at_offset;
        // user:password@ or :password@
        if let Some(colon_offset) = url[authority_start..at_pos].find(':') {
            let colon_pos = authority_start + colon_offset;
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}
