use crate::errors::{QuotaError, Result};
use crate::limiter::{
    bucket_key, idempotency_key, ConsumeRequest, DistributedBucketStore, DistributedDecision,
};
use crate::redis::pool::get_pool_stats;
use crate::redis::script::{get_script, load_script};
use crate::redis::parse_script_response;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Distributed bucket store backed by Redis and the token bucket script.
pub struct RedisBucketStore {
    pool: Arc<Pool>,
    script: Script,
    idempotency_ttl: Duration,
}

impl RedisBucketStore {
    /// Wrap a pool and preload the script.
    pub async fn new(pool: Pool, idempotency_ttl: Duration) -> Result<Self> {
        let pool = Arc::new(pool);

        let mut conn = pool.get().await.map_err(|e| {
            QuotaError::RedisPoolError(format!("Failed to get connection for script loading: {}", e))
        })?;
        let _sha = load_script(&mut *conn).await?;

        Ok(Self {
            pool,
            script: get_script(),
            idempotency_ttl,
        })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            QuotaError::RedisPoolError(e.to_string())
        })
    }
}

#[async_trait]
impl DistributedBucketStore for RedisBucketStore {
    async fn try_consume_tokens(&self, request: &ConsumeRequest<'_>) -> Result<DistributedDecision> {
        let mut conn = self.connection().await?;

        let bucket = bucket_key(request.tenant_id, request.resource_key);
        debug!(
            "Executing token bucket script: key={}, tokens={}, request_id={}",
            bucket, request.tokens, request.request_id
        );

        // ARGV: capacity, refill_rate, tokens, now_ms, request_id, ttl_secs
        let started = std::time::Instant::now();
        let result: redis::Value = self
            .script
            .key(&bucket)
            .key(idempotency_key(request.request_id))
            .arg(request.capacity)
            .arg(request.refill_rate.to_string())
            .arg(request.tokens)
            .arg(request.now_millis)
            .arg(request.request_id)
            .arg(self.idempotency_ttl.as_secs())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| {
                error!("Script execution failed: {}", e);
                crate::metrics::record_script_execution(false);
                QuotaError::ScriptExecutionError(format!("Script execution failed: {}", e))
            })?;
        crate::metrics::record_script_execution(true);
        crate::metrics::record_redis_duration("token_bucket", started.elapsed().as_secs_f64());

        let decision = parse_script_response(result)?;
        debug!(
            "Script result: allowed={}, remaining={}, reason={}",
            decision.allowed,
            decision.remaining,
            decision.reason.as_str()
        );
        Ok(decision)
    }

    async fn health_check(&self) -> Result<()> {
        let stats = get_pool_stats(&self.pool);
        debug!(
            "Redis pool: size={}, available={}, max={}",
            stats.size, stats.available, stats.max_size
        );

        let mut conn = self.connection().await?;
        let response: String = redis::cmd("PING").query_async(&mut *conn).await?;

        if response != "PONG" {
            return Err(QuotaError::InternalError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}
