//! The authoritative tier: a fleet-wide bucket consumed in one atomic step,
//! with request-level idempotency.

use crate::check::Reason;
use crate::errors::{QuotaError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::debug;

/// Default lifetime of an idempotency marker.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);

/// Key of the shared bucket for a tenant/resource pair.
pub fn bucket_key(tenant_id: &str, resource_key: &str) -> String {
    format!("rate_limiter:{}:{}", tenant_id, resource_key)
}

/// Key of the idempotency marker for a request.
pub fn idempotency_key(request_id: &str) -> String {
    format!("rate_limiter:idempotent:{}", request_id)
}

/// Arguments of one atomic consume.
#[derive(Debug, Clone)]
pub struct ConsumeRequest<'a> {
    pub tenant_id: &'a str,
    pub resource_key: &'a str,
    pub capacity: u64,
    pub refill_rate: Decimal,
    pub tokens: u64,
    pub request_id: &'a str,
    pub now_millis: i64,
}

/// Result of the atomic operation: `{allowed, remaining, reason}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reason: Reason,
}

#[async_trait]
pub trait DistributedBucketStore: Send + Sync {
    /// Read, refill, check idempotency, decide and write, with no
    /// interleaving from other callers on the same bucket.
    async fn try_consume_tokens(&self, request: &ConsumeRequest<'_>) -> Result<DistributedDecision>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct BucketRecord {
    tokens: f64,
    last_refill_millis: i64,
}

#[derive(Debug, Clone)]
struct Marker {
    decision: DistributedDecision,
    expires_at_millis: i64,
}

/// Single-process stand-in for the shared store.
///
/// Each bucket is updated while holding its map shard entry, which also
/// covers the marker check and write for requests against that bucket.
pub struct InMemoryBucketStore {
    buckets: DashMap<String, BucketRecord>,
    markers: DashMap<String, Marker>,
    idempotency_ttl: Duration,
}

impl Default for InMemoryBucketStore {
    fn default() -> Self {
        Self::new(DEFAULT_IDEMPOTENCY_TTL)
    }
}

impl InMemoryBucketStore {
    pub fn new(idempotency_ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            markers: DashMap::new(),
            idempotency_ttl,
        }
    }

    /// Whole tokens currently stored for a pair, without refilling.
    pub fn stored_tokens(&self, tenant_id: &str, resource_key: &str) -> Option<u64> {
        self.buckets
            .get(&bucket_key(tenant_id, resource_key))
            .map(|record| record.tokens.floor() as u64)
    }

    /// Drop expired markers.
    pub fn purge_expired(&self, now_millis: i64) {
        self.markers.retain(|_, marker| marker.expires_at_millis > now_millis);
    }
}

#[async_trait]
impl DistributedBucketStore for InMemoryBucketStore {
    async fn try_consume_tokens(&self, request: &ConsumeRequest<'_>) -> Result<DistributedDecision> {
        let refill_rate = request.refill_rate.to_f64().ok_or_else(|| {
            QuotaError::InvalidPolicy(format!("refill rate {} is not representable", request.refill_rate))
        })?;
        let capacity = request.capacity as f64;
        let marker_key = idempotency_key(request.request_id);

        let mut record = self
            .buckets
            .entry(bucket_key(request.tenant_id, request.resource_key))
            .or_insert_with(|| BucketRecord {
                tokens: capacity,
                last_refill_millis: request.now_millis,
            });

        if let Some(marker) = self.markers.get(&marker_key) {
            if marker.expires_at_millis > request.now_millis {
                debug!(request_id = %request.request_id, "Replaying recorded decision");
                return Ok(marker.decision.clone());
            }
        }

        let elapsed = request.now_millis - record.last_refill_millis;
        if elapsed > 0 {
            record.tokens = (record.tokens + (elapsed as f64 / 1000.0) * refill_rate).min(capacity);
            record.last_refill_millis = request.now_millis;
        }
        record.tokens = record.tokens.min(capacity);

        let requested = request.tokens as f64;
        let decision = if record.tokens >= requested {
            record.tokens -= requested;
            DistributedDecision {
                allowed: true,
                remaining: record.tokens.floor() as u64,
                reason: Reason::None,
            }
        } else {
            DistributedDecision {
                allowed: false,
                remaining: record.tokens.floor() as u64,
                reason: Reason::QuotaExceeded,
            }
        };

        self.markers.insert(
            marker_key,
            Marker {
                decision: decision.clone(),
                expires_at_millis: request.now_millis + self.idempotency_ttl.as_millis() as i64,
            },
        );

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn req<'a>(request_id: &'a str, tokens: u64, now_millis: i64) -> ConsumeRequest<'a> {
        ConsumeRequest {
            tenant_id: "t1",
            resource_key: "/orders",
            capacity: 100,
            refill_rate: Decimal::new(10, 0),
            tokens,
            request_id,
            now_millis,
        }
    }

    #[test]
    fn keys_follow_the_shared_namespace() {
        assert_eq!(bucket_key("t1", "/orders"), "rate_limiter:t1:/orders");
        assert_eq!(idempotency_key("req-9"), "rate_limiter:idempotent:req-9");
    }

    #[tokio::test]
    async fn consumes_from_a_full_bucket() {
        let store = InMemoryBucketStore::default();
        let decision = store.try_consume_tokens(&req("a", 1, T0)).await.unwrap();
        assert_eq!(
            decision,
            DistributedDecision {
                allowed: true,
                remaining: 99,
                reason: Reason::None
            }
        );
    }

    #[tokio::test]
    async fn denies_with_quota_exceeded() {
        let store = InMemoryBucketStore::default();
        assert!(store.try_consume_tokens(&req("a", 95, T0)).await.unwrap().allowed);

        let denied = store.try_consume_tokens(&req("b", 10, T0)).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 5);
        assert_eq!(denied.reason, Reason::QuotaExceeded);
    }

    #[tokio::test]
    async fn repeated_request_id_replays_without_double_deduct() {
        let store = InMemoryBucketStore::default();
        let first = store.try_consume_tokens(&req("dup", 10, T0)).await.unwrap();
        let second = store.try_consume_tokens(&req("dup", 10, T0 + 5)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.stored_tokens("t1", "/orders"), Some(90));
    }

    #[tokio::test]
    async fn replayed_denial_stays_denied_after_refill() {
        let store = InMemoryBucketStore::default();
        assert!(store.try_consume_tokens(&req("a", 100, T0)).await.unwrap().allowed);
        let denied = store.try_consume_tokens(&req("b", 5, T0)).await.unwrap();
        assert!(!denied.allowed);

        let replay = store.try_consume_tokens(&req("b", 5, T0 + 10_000)).await.unwrap();
        assert_eq!(replay, denied);
    }

    #[tokio::test]
    async fn marker_expiry_makes_request_id_new_again() {
        let store = InMemoryBucketStore::new(Duration::from_secs(1));
        assert!(store.try_consume_tokens(&req("r", 60, T0)).await.unwrap().allowed);

        let again = store.try_consume_tokens(&req("r", 60, T0 + 1_000)).await.unwrap();
        // 40 left + 10 refilled
        assert!(!again.allowed);
        assert_eq!(again.remaining, 50);
    }

    #[tokio::test]
    async fn refill_is_capped_at_capacity() {
        let store = InMemoryBucketStore::default();
        assert!(store.try_consume_tokens(&req("a", 50, T0)).await.unwrap().allowed);
        let later = store.try_consume_tokens(&req("b", 1, T0 + 3_600_000)).await.unwrap();
        assert_eq!(later.remaining, 99);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_markers() {
        let store = InMemoryBucketStore::new(Duration::from_secs(1));
        store.try_consume_tokens(&req("old", 1, T0)).await.unwrap();
        store.try_consume_tokens(&req("new", 1, T0 + 900)).await.unwrap();

        store.purge_expired(T0 + 1_000);
        assert!(!store.markers.contains_key(&idempotency_key("old")));
        assert!(store.markers.contains_key(&idempotency_key("new")));
    }
}
