use crate::check::replay::ReplayCache;
use crate::check::{CheckRequest, CheckResponse, ProcessPath, Reason};
use crate::clock::Clock;
use crate::errors::{QuotaError, Result};
use crate::events::{EventPublisher, QuotaConsumedEvent};
use crate::limiter::distributed::DEFAULT_IDEMPOTENCY_TTL;
use crate::limiter::{ConsumeRequest, DistributedBucketStore, LocalBucketEngine};
use crate::policy::PolicyCache;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default bound on one call to the distributed store.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(200);

/// Outcome of the decision stage, before the response is built.
#[derive(Debug, Clone)]
struct Decision {
    allowed: bool,
    remaining: u64,
    reason: Reason,
    policy_version: Option<String>,
    path: ProcessPath,
}

impl Decision {
    fn internal_error(policy_version: Option<String>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reason: Reason::InternalError,
            policy_version,
            path: ProcessPath::Error,
        }
    }
}

/// Runs one quota check: policy lookup, local tier, then the distributed
/// tier when the local bucket denies. Always produces a response.
///
/// A request id seen within the idempotency window gets its first decision
/// back from either tier without consuming again.
pub struct CheckCoordinator {
    policies: Arc<PolicyCache>,
    local: Arc<LocalBucketEngine>,
    distributed: Arc<dyn DistributedBucketStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    replays: ReplayCache<Decision>,
}

impl CheckCoordinator {
    pub fn new(
        policies: Arc<PolicyCache>,
        local: Arc<LocalBucketEngine>,
        distributed: Arc<dyn DistributedBucketStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policies,
            local,
            distributed,
            publisher,
            clock,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            replays: ReplayCache::new(DEFAULT_IDEMPOTENCY_TTL),
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// How long a decision is replayed for a repeated request id.
    pub fn with_replay_ttl(mut self, ttl: Duration) -> Self {
        self.replays = ReplayCache::new(ttl);
        self
    }

    /// Forget decisions whose replay window has closed.
    pub fn purge_replays(&self) {
        self.replays.purge_expired(self.clock.now_millis());
    }

    pub fn policies(&self) -> &Arc<PolicyCache> {
        &self.policies
    }

    pub fn distributed(&self) -> &Arc<dyn DistributedBucketStore> {
        &self.distributed
    }

    pub async fn check(&self, request: CheckRequest, trace_id: Option<String>) -> CheckResponse {
        let started = Instant::now();
        let now = self.clock.now_millis();

        let decision = match AssertUnwindSafe(self.decide(&request, now))
            .catch_unwind()
            .await
        {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!(
                    tenant_id = %request.tenant_id,
                    resource_key = %request.resource_key,
                    request_id = %request.request_id,
                    error = %e,
                    "Quota check failed"
                );
                crate::metrics::record_check_error(e.kind());
                let version = self
                    .policies
                    .find_policy(&request.tenant_id, &request.resource_key)
                    .map(|p| p.version.clone());
                Decision::internal_error(version)
            }
            Err(_) => {
                error!(
                    tenant_id = %request.tenant_id,
                    resource_key = %request.resource_key,
                    request_id = %request.request_id,
                    "Quota check panicked"
                );
                crate::metrics::record_check_error("panic");
                Decision::internal_error(None)
            }
        };

        let response = CheckResponse {
            allowed: decision.allowed,
            remaining: decision.remaining,
            policy_version: decision.policy_version,
            reason: decision.reason,
            tenant_id: request.tenant_id.clone(),
            resource_key: request.resource_key.clone(),
            request_id: request.request_id.clone(),
            timestamp: now,
        };

        let elapsed = started.elapsed();
        crate::metrics::record_check(decision.path.as_str(), response.allowed, elapsed.as_secs_f64());
        if !response.allowed {
            crate::metrics::record_denied(response.reason.as_str());
        }

        debug!(
            tenant_id = %response.tenant_id,
            resource_key = %response.resource_key,
            request_id = %response.request_id,
            allowed = response.allowed,
            remaining = response.remaining,
            path = decision.path.as_str(),
            "Quota check decided"
        );

        let event = QuotaConsumedEvent::from_decision(
            &request,
            &response,
            decision.path,
            trace_id,
            Some(elapsed.as_millis() as u64),
        );
        if let Err(e) = self.publisher.publish(event) {
            warn!(
                request_id = %response.request_id,
                error = %e,
                "Failed to publish quota event"
            );
        }

        response
    }

    async fn decide(&self, request: &CheckRequest, now: i64) -> Result<Decision> {
        let tenant = request.tenant_id.as_str();
        let resource = request.resource_key.as_str();

        let policy = match self.policies.find_policy(tenant, resource) {
            Some(policy) => policy,
            None => {
                let reason = if self.policies.is_disabled(tenant, resource) {
                    Reason::PolicyDisabled
                } else {
                    Reason::PolicyNotFound
                };
                return Ok(Decision {
                    allowed: false,
                    remaining: 0,
                    reason,
                    policy_version: None,
                    path: ProcessPath::PolicyNotFound,
                });
            }
        };

        let tokens = request.tokens_requested();
        let version = Some(policy.version.clone());

        let settled = self.replays.replay_or_decide(&request.request_id, now, || {
            self.local
                .try_consume(tenant, resource, policy.capacity, policy.refill_rate, tokens, now)
                .then(|| Decision {
                    allowed: true,
                    remaining: self.local.estimate_remaining(tenant, resource, now),
                    reason: Reason::None,
                    policy_version: version.clone(),
                    path: ProcessPath::Local,
                })
        });
        if let Some(decision) = settled {
            return Ok(decision);
        }

        let consume = ConsumeRequest {
            tenant_id: tenant,
            resource_key: resource,
            capacity: policy.capacity,
            refill_rate: policy.refill_rate,
            tokens,
            request_id: &request.request_id,
            now_millis: now,
        };

        let outcome = tokio::time::timeout(self.store_timeout, self.distributed.try_consume_tokens(&consume))
            .await
            .map_err(|_| {
                QuotaError::Timeout(format!(
                    "distributed bucket call exceeded {}ms",
                    self.store_timeout.as_millis()
                ))
            })??;

        let decision = Decision {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            reason: outcome.reason,
            policy_version: version,
            path: ProcessPath::Distributed,
        };
        self.replays.record(&request.request_id, decision.clone(), now);
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limiter::{DistributedDecision, InMemoryBucketStore};
    use crate::policy::Policy;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::num::NonZeroUsize;

    #[derive(Default)]
    struct Capture {
        events: Mutex<Vec<QuotaConsumedEvent>>,
    }

    impl EventPublisher for Capture {
        fn publish(&self, event: QuotaConsumedEvent) -> Result<()> {
            self.events.lock().push(event);
            Ok(())
        }
    }

    struct Refusing;

    impl EventPublisher for Refusing {
        fn publish(&self, _event: QuotaConsumedEvent) -> Result<()> {
            Err(QuotaError::InternalError("queue full".into()))
        }
    }

    struct Broken;

    #[async_trait]
    impl DistributedBucketStore for Broken {
        async fn try_consume_tokens(&self, _request: &ConsumeRequest<'_>) -> Result<DistributedDecision> {
            Err(QuotaError::RedisPoolError("no connections".into()))
        }
    }

    struct Stalled;

    #[async_trait]
    impl DistributedBucketStore for Stalled {
        async fn try_consume_tokens(&self, _request: &ConsumeRequest<'_>) -> Result<DistributedDecision> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(QuotaError::InternalError("unreachable".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl DistributedBucketStore for Panicking {
        async fn try_consume_tokens(&self, _request: &ConsumeRequest<'_>) -> Result<DistributedDecision> {
            panic!("store exploded");
        }
    }

    fn policy(capacity: u64, rate: &str, enabled: bool) -> Policy {
        Policy {
            tenant_id: "t1".into(),
            resource_key: "/orders".into(),
            capacity,
            refill_rate: rate.parse::<Decimal>().unwrap(),
            enabled,
            version: "v1".into(),
            id: None,
            description: None,
        }
    }

    fn coordinator(
        policies: Vec<Policy>,
        store: Arc<dyn DistributedBucketStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> CheckCoordinator {
        let cache = Arc::new(PolicyCache::new());
        cache.update_policies(policies);
        CheckCoordinator::new(
            cache,
            Arc::new(LocalBucketEngine::new(NonZeroUsize::new(64).unwrap())),
            store,
            publisher,
            Arc::new(ManualClock::new(1_000_000)),
        )
    }

    #[tokio::test]
    async fn allows_locally_and_emits_one_event() {
        let capture = Arc::new(Capture::default());
        let c = coordinator(
            vec![policy(10, "1", true)],
            Arc::new(InMemoryBucketStore::default()),
            capture.clone(),
        );

        let resp = c.check(CheckRequest::new("r1", "t1", "/orders", 3), Some("trace-1".into())).await;
        assert!(resp.allowed);
        assert_eq!(resp.remaining, 7);
        assert_eq!(resp.policy_version.as_deref(), Some("v1"));
        assert_eq!(resp.timestamp, 1_000_000);

        let events = capture.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].process_path, ProcessPath::Local);
        assert_eq!(events[0].tokens_consumed, 3);
        assert_eq!(events[0].trace_id.as_deref(), Some("trace-1"));
    }

    #[tokio::test]
    async fn unknown_policy_skips_both_tiers() {
        let capture = Arc::new(Capture::default());
        let c = coordinator(vec![], Arc::new(Broken), capture.clone());

        let resp = c.check(CheckRequest::new("r1", "t1", "/orders", 1), None).await;
        assert!(!resp.allowed);
        assert_eq!(resp.reason, Reason::PolicyNotFound);
        assert_eq!(resp.remaining, 0);
        assert_eq!(capture.events.lock()[0].process_path, ProcessPath::PolicyNotFound);
    }

    #[tokio::test]
    async fn disabled_policy_is_reported_as_such() {
        let c = coordinator(
            vec![policy(10, "1", false)],
            Arc::new(InMemoryBucketStore::default()),
            Arc::new(Capture::default()),
        );

        let resp = c.check(CheckRequest::new("r1", "t1", "/orders", 1), None).await;
        assert!(!resp.allowed);
        assert_eq!(resp.reason, Reason::PolicyDisabled);
    }

    #[tokio::test]
    async fn local_denial_falls_back_to_distributed_tier() {
        let capture = Arc::new(Capture::default());
        let c = coordinator(
            vec![policy(5, "1", true)],
            Arc::new(InMemoryBucketStore::default()),
            capture.clone(),
        );

        let local = c.check(CheckRequest::new("r1", "t1", "/orders", 5), None).await;
        assert!(local.allowed);

        let fallback = c.check(CheckRequest::new("r2", "t1", "/orders", 2), None).await;
        assert!(fallback.allowed);
        assert_eq!(fallback.remaining, 3);
        assert_eq!(capture.events.lock()[1].process_path, ProcessPath::Distributed);
    }

    #[tokio::test]
    async fn store_failure_becomes_internal_error() {
        let capture = Arc::new(Capture::default());
        let c = coordinator(vec![policy(1, "1", true)], Arc::new(Broken), capture.clone());

        c.check(CheckRequest::new("r1", "t1", "/orders", 1), None).await;
        let resp = c.check(CheckRequest::new("r2", "t1", "/orders", 1), None).await;
        assert!(!resp.allowed);
        assert_eq!(resp.reason, Reason::InternalError);
        assert_eq!(resp.remaining, 0);

        let events = capture.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].process_path, ProcessPath::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_times_out() {
        let c = coordinator(vec![policy(1, "1", true)], Arc::new(Stalled), Arc::new(Capture::default()))
            .with_store_timeout(Duration::from_millis(50));

        c.check(CheckRequest::new("r1", "t1", "/orders", 1), None).await;
        let resp = c.check(CheckRequest::new("r2", "t1", "/orders", 1), None).await;
        assert_eq!(resp.reason, Reason::InternalError);
    }

    #[tokio::test]
    async fn panic_in_store_is_contained() {
        let capture = Arc::new(Capture::default());
        let c = coordinator(vec![policy(1, "1", true)], Arc::new(Panicking), capture.clone());

        c.check(CheckRequest::new("r1", "t1", "/orders", 1), None).await;
        let resp = c.check(CheckRequest::new("r2", "t1", "/orders", 1), None).await;
        assert!(!resp.allowed);
        assert_eq!(resp.reason, Reason::InternalError);
        assert_eq!(capture.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn repeated_request_id_replays_local_decision() {
        let capture = Arc::new(Capture::default());
        let c = coordinator(
            vec![policy(1000, "10", true)],
            Arc::new(InMemoryBucketStore::default()),
            capture.clone(),
        );

        let first = c.check(CheckRequest::new("dup", "t1", "/orders", 7), None).await;
        let second = c.check(CheckRequest::new("dup", "t1", "/orders", 7), None).await;

        assert!(first.allowed && second.allowed);
        assert_eq!(first.remaining, 993);
        assert_eq!(second.remaining, 993);
        assert_eq!(c.local.estimate_remaining("t1", "/orders", 1_000_000), 993);

        let events = capture.events.lock();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.process_path == ProcessPath::Local));
    }

    #[tokio::test]
    async fn replayed_decision_expires_with_its_window() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = Arc::new(PolicyCache::new());
        cache.update_policies(vec![policy(1000, "10", true)]);
        let c = CheckCoordinator::new(
            cache,
            Arc::new(LocalBucketEngine::new(NonZeroUsize::new(64).unwrap())),
            Arc::new(InMemoryBucketStore::default()),
            Arc::new(Capture::default()),
            clock.clone(),
        )
        .with_replay_ttl(Duration::from_secs(1));

        let first = c.check(CheckRequest::new("dup", "t1", "/orders", 500), None).await;
        assert_eq!(first.remaining, 500);

        clock.advance_millis(1_000);
        c.purge_replays();
        let again = c.check(CheckRequest::new("dup", "t1", "/orders", 500), None).await;

        // 500 + 10 refilled, then charged again.
        assert_eq!(again.remaining, 10);
    }

    #[tokio::test]
    async fn publish_failure_does_not_change_the_response() {
        let c = coordinator(
            vec![policy(10, "1", true)],
            Arc::new(InMemoryBucketStore::default()),
            Arc::new(Refusing),
        );

        let resp = c.check(CheckRequest::new("r1", "t1", "/orders", 1), None).await;
        assert!(resp.allowed);
        assert_eq!(resp.remaining, 9);
    }
}
