use crate::config::{
    AppConfig, AuditConfig, DistributedBackend, EventsConfig, LocalBucketConfig, PolicySourceKind,
    PolicySyncConfig, RedisConfig,
};
use crate::errors::{QuotaError, Result};
use crate::policy::Policy;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Validate the entire check-service configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    if config.server.host.is_empty() {
        return Err(QuotaError::ConfigurationError(
            "HTTP host cannot be empty".to_string(),
        ));
    }

    if config.backend == DistributedBackend::Redis {
        validate_redis_config(&config.redis)?;
    } else {
        warn!("Distributed tier is in-process only; buckets are not shared across instances");
    }

    validate_policy_sync_config(&config.policy)?;
    validate_local_config(&config.local)?;
    validate_events_config(&config.events)?;

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate Redis configuration
fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(QuotaError::ConfigurationError(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(QuotaError::ConfigurationError(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(QuotaError::ConfigurationError(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connection_timeout_secs == 0 {
        return Err(QuotaError::ConfigurationError(
            "connection_timeout_secs must be greater than 0".to_string(),
        ));
    }

    if config.command_timeout_ms == 0 {
        return Err(QuotaError::ConfigurationError(
            "command_timeout_ms must be greater than 0".to_string(),
        ));
    }

    if config.idempotency_ttl_secs == 0 {
        return Err(QuotaError::ConfigurationError(
            "idempotency_ttl_secs must be greater than 0".to_string(),
        ));
    }

    debug!("Redis configuration valid");
    Ok(())
}

fn validate_policy_sync_config(config: &PolicySyncConfig) -> Result<()> {
    match config.source {
        PolicySourceKind::Http => {
            if !config.control_plane_url.starts_with("http://")
                && !config.control_plane_url.starts_with("https://")
            {
                return Err(QuotaError::ConfigurationError(format!(
                    "Invalid control plane URL: {}. Must start with http:// or https://",
                    config.control_plane_url
                )));
            }
        }
        PolicySourceKind::File => {
            if config.file.as_os_str().is_empty() {
                return Err(QuotaError::ConfigurationError(
                    "Policy file path cannot be empty".to_string(),
                ));
            }
        }
    }

    if config.sync_interval_secs == 0 {
        return Err(QuotaError::ConfigurationError(
            "sync_interval_secs must be greater than 0".to_string(),
        ));
    }

    if config.fetch_timeout_secs == 0 {
        return Err(QuotaError::ConfigurationError(
            "fetch_timeout_secs must be greater than 0".to_string(),
        ));
    }

    if config.fetch_timeout_secs > config.sync_interval_secs {
        warn!(
            "Policy fetch timeout ({}s) is longer than the sync interval ({}s)",
            config.fetch_timeout_secs, config.sync_interval_secs
        );
    }

    Ok(())
}

fn validate_local_config(config: &LocalBucketConfig) -> Result<()> {
    if config.max_buckets == 0 {
        return Err(QuotaError::ConfigurationError(
            "max_buckets must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_events_config(config: &EventsConfig) -> Result<()> {
    if config.topic.is_empty() {
        return Err(QuotaError::ConfigurationError(
            "Kafka topic cannot be empty".to_string(),
        ));
    }

    if config.time_slice_secs == 0 {
        return Err(QuotaError::ConfigurationError(
            "time_slice_secs must be greater than 0".to_string(),
        ));
    }

    if config.delivery_timeout_ms == 0 {
        return Err(QuotaError::ConfigurationError(
            "delivery_timeout_ms must be greater than 0".to_string(),
        ));
    }

    if config.brokers.is_none() {
        warn!("KAFKA_BROKERS not set; quota events will only be logged");
    }

    Ok(())
}

/// Validate the audit consumer configuration
pub fn validate_audit_config(config: &AuditConfig) -> Result<()> {
    if !config.database_url.starts_with("sqlite:") {
        return Err(QuotaError::ConfigurationError(format!(
            "Invalid audit database URL: {}. Must start with sqlite:",
            config.database_url
        )));
    }

    if config.brokers.is_empty() || config.topic.is_empty() || config.group_id.is_empty() {
        return Err(QuotaError::ConfigurationError(
            "Kafka brokers, topic and group id are required".to_string(),
        ));
    }

    if config.consumers == 0 {
        return Err(QuotaError::ConfigurationError(
            "consumers must be greater than 0".to_string(),
        ));
    }

    if config.batch_size == 0 {
        return Err(QuotaError::ConfigurationError(
            "batch_size must be greater than 0".to_string(),
        ));
    }

    if config.batch_wait_ms == 0 {
        return Err(QuotaError::ConfigurationError(
            "batch_wait_ms must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate a single published policy
pub fn validate_policy(policy: &Policy) -> Result<()> {
    if policy.tenant_id.is_empty() {
        return Err(QuotaError::InvalidPolicy(
            "tenant_id cannot be empty".to_string(),
        ));
    }

    if policy.resource_key.is_empty() {
        return Err(QuotaError::InvalidPolicy(format!(
            "resource_key cannot be empty for tenant '{}'",
            policy.tenant_id
        )));
    }

    if policy.capacity == 0 {
        return Err(QuotaError::InvalidPolicy(format!(
            "capacity must be positive for '{}' '{}'",
            policy.tenant_id, policy.resource_key
        )));
    }

    if policy.refill_rate <= Decimal::ZERO {
        return Err(QuotaError::InvalidPolicy(format!(
            "refill_rate must be positive for '{}' '{}' (got {})",
            policy.tenant_id, policy.resource_key, policy.refill_rate
        )));
    }

    let rate = policy.refill_rate.to_f64().unwrap_or(0.0);
    if !rate.is_finite() || rate <= 0.0 {
        return Err(QuotaError::InvalidPolicy(format!(
            "refill_rate {} for '{}' '{}' is not representable",
            policy.refill_rate, policy.tenant_id, policy.resource_key
        )));
    }

    if policy.capacity > 1_000_000_000 {
        warn!(
            "Very high capacity ({}) for '{}' '{}'",
            policy.capacity, policy.tenant_id, policy.resource_key
        );
    }

    let seconds_to_fill = policy.capacity as f64 / rate;
    if seconds_to_fill > 86400.0 {
        warn!(
            "Bucket for '{}' '{}' takes {:.2} hours to refill",
            policy.tenant_id,
            policy.resource_key,
            seconds_to_fill / 3600.0
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig {
            server: crate::server::ServerConfig::default(),
            backend: DistributedBackend::Redis,
            redis: RedisConfig::default(),
            policy: PolicySyncConfig::default(),
            local: LocalBucketConfig::default(),
            events: EventsConfig::default(),
        }
    }

    fn policy(capacity: u64, rate: &str) -> Policy {
        Policy {
            tenant_id: "t1".into(),
            resource_key: "/orders".into(),
            capacity,
            refill_rate: rate.parse().unwrap(),
            enabled: true,
            version: "1".into(),
            id: None,
            description: None,
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&config()).is_ok());
        assert!(validate_audit_config(&AuditConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_invalid_redis_url() {
        let mut config = config();
        config.redis.url = "invalid_url".to_string();
        assert!(validate_config(&config).is_err());

        config.backend = DistributedBackend::Memory;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_zero_sizes_and_intervals() {
        let mut c = config();
        c.local.max_buckets = 0;
        assert!(validate_config(&c).is_err());

        let mut c = config();
        c.policy.sync_interval_secs = 0;
        assert!(validate_config(&c).is_err());

        let mut audit = AuditConfig::default();
        audit.batch_size = 0;
        assert!(validate_audit_config(&audit).is_err());
    }

    #[test]
    fn test_validate_zero_refill_rate() {
        assert!(validate_policy(&policy(100, "0")).is_err());
        assert!(validate_policy(&policy(100, "-1.5")).is_err());
        assert!(validate_policy(&policy(100, "0.001")).is_ok());
    }

    #[test]
    fn test_validate_zero_capacity() {
        assert!(validate_policy(&policy(0, "10")).is_err());
    }

    #[test]
    fn test_validate_missing_ids() {
        let mut p = policy(10, "1");
        p.resource_key.clear();
        assert!(validate_policy(&p).is_err());
    }
}
