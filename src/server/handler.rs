use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

use crate::api::ApiResponse;
use crate::check::CheckRequest;
use crate::errors::QuotaError;
use crate::server::AppState;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

impl IntoResponse for QuotaError {
    fn into_response(self) -> Response {
        error_response(self, None)
    }
}

fn error_response(err: QuotaError, trace_id: Option<String>) -> Response {
    let body = ApiResponse::<()>::fail(err.code(), err.to_string(), HashMap::new(), trace_id);
    (err.status(), Json(body)).into_response()
}

fn trace_id_from(headers: &HeaderMap) -> String {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

fn with_trace_header(mut response: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

/// Reject requests the coordinator cannot meaningfully decide on.
fn validate_request(request: &CheckRequest) -> Result<(), QuotaError> {
    if request.request_id.trim().is_empty() {
        return Err(QuotaError::InvalidRequest("requestId is required".to_string()));
    }
    if request.tenant_id.trim().is_empty() {
        return Err(QuotaError::InvalidRequest("tenantId is required".to_string()));
    }
    if request.resource_key.trim().is_empty() {
        return Err(QuotaError::InvalidRequest("resourceKey is required".to_string()));
    }
    if request.tokens == Some(0) {
        return Err(QuotaError::InvalidRequest("tokens must be at least 1".to_string()));
    }
    Ok(())
}

/// POST /api/v1/check
pub async fn check(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CheckRequest>, JsonRejection>,
) -> Response {
    let trace_id = trace_id_from(&headers);

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!("Rejected check body: {}", rejection.body_text());
            let err = QuotaError::InvalidRequest(rejection.body_text());
            return with_trace_header(error_response(err, Some(trace_id.clone())), &trace_id);
        }
    };

    if let Err(err) = validate_request(&request) {
        return with_trace_header(error_response(err, Some(trace_id.clone())), &trace_id);
    }

    let span = info_span!(
        "check",
        trace_id = %trace_id,
        tenant_id = %request.tenant_id,
        resource_key = %request.resource_key,
        request_id = %request.request_id,
    );

    let response = state
        .coordinator
        .check(request, Some(trace_id.clone()))
        .instrument(span)
        .await;

    let request_id = Some(response.request_id.clone());
    let body = ApiResponse::ok(response, request_id, Some(trace_id.clone()));
    with_trace_header((StatusCode::OK, Json(body)).into_response(), &trace_id)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub policies: usize,
    pub distributed_store: String,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    let policies = state.coordinator.policies().len();
    let store = tokio::time::timeout(HEALTH_TIMEOUT, state.coordinator.distributed().health_check()).await;

    let (code, status, distributed_store) = match store {
        Ok(Ok(())) => (StatusCode::OK, "UP", "UP".to_string()),
        Ok(Err(e)) => {
            warn!("Distributed store health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "DOWN", e.to_string())
        }
        Err(_) => {
            warn!("Distributed store health check timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "DOWN", "timeout".to_string())
        }
    };

    let body = HealthStatus {
        status,
        policies,
        distributed_store,
    };
    (code, Json(body)).into_response()
}

/// GET /metrics
pub async fn metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::gather(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckCoordinator;
    use crate::clock::ManualClock;
    use crate::errors::Result;
    use crate::events::TracingEventPublisher;
    use crate::limiter::{
        ConsumeRequest, DistributedBucketStore, DistributedDecision, InMemoryBucketStore,
        LocalBucketEngine,
    };
    use crate::policy::{Policy, PolicyCache};
    use crate::server::router;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::num::NonZeroUsize;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Down;

    #[async_trait]
    impl DistributedBucketStore for Down {
        async fn try_consume_tokens(&self, _request: &ConsumeRequest<'_>) -> Result<DistributedDecision> {
            Err(QuotaError::RedisPoolError("down".into()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(QuotaError::RedisPoolError("connection refused".into()))
        }
    }

    fn state(store: Arc<dyn DistributedBucketStore>) -> AppState {
        let cache = Arc::new(PolicyCache::new());
        cache.update_policies(vec![Policy {
            tenant_id: "t1".into(),
            resource_key: "/orders".into(),
            capacity: 100,
            refill_rate: "10".parse().unwrap(),
            enabled: true,
            version: "v7".into(),
            id: Some(1),
            description: None,
        }]);
        let coordinator = CheckCoordinator::new(
            cache,
            Arc::new(LocalBucketEngine::new(NonZeroUsize::new(16).unwrap())),
            store,
            Arc::new(TracingEventPublisher),
            Arc::new(ManualClock::new(5_000)),
        );
        AppState {
            coordinator: Arc::new(coordinator),
        }
    }

    fn post_check(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/check")
            .header(header::CONTENT_TYPE, "application/json")
            .header(TRACE_ID_HEADER, "trace-abc")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn check_returns_wrapped_decision() {
        let app = router(state(Arc::new(InMemoryBucketStore::default())));
        let response = app
            .oneshot(post_check(
                r#"{"requestId":"r1","tenantId":"t1","resourceKey":"/orders","tokens":5}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[TRACE_ID_HEADER], "trace-abc");

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["traceId"], "trace-abc");
        assert_eq!(body["requestId"], "r1");
        assert_eq!(body["data"]["allowed"], true);
        assert_eq!(body["data"]["remaining"], 95);
        assert_eq!(body["data"]["policyVersion"], "v7");
    }

    #[tokio::test]
    async fn denial_is_still_a_200() {
        let app = router(state(Arc::new(InMemoryBucketStore::default())));
        let response = app
            .oneshot(post_check(
                r#"{"requestId":"r1","tenantId":"t9","resourceKey":"/orders"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["allowed"], false);
        assert_eq!(body["data"]["reason"], "policy_not_found");
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let app = router(state(Arc::new(InMemoryBucketStore::default())));
        let response = app.oneshot(post_check("{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_ARGUMENT");
        assert_eq!(body["traceId"], "trace-abc");
    }

    #[tokio::test]
    async fn missing_ids_and_zero_tokens_are_rejected() {
        let app = router(state(Arc::new(InMemoryBucketStore::default())));

        let response = app
            .clone()
            .oneshot(post_check(r#"{"requestId":"","tenantId":"t1","resourceKey":"/orders"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_check(
                r#"{"requestId":"r1","tenantId":"t1","resourceKey":"/orders","tokens":0}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn store_outage_is_a_denial_not_a_5xx() {
        let app = router(state(Arc::new(Down)));
        let response = app
            .oneshot(post_check(
                r#"{"requestId":"r1","tenantId":"t1","resourceKey":"/orders","tokens":500}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["reason"], "internal_error");
        assert_eq!(body["data"]["remaining"], 0);
    }

    #[tokio::test]
    async fn health_reflects_store_state() {
        let up = router(state(Arc::new(InMemoryBucketStore::default())));
        let response = up
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["policies"], 1);

        let down = router(state(Arc::new(Down)));
        let response = down
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "DOWN");
    }

    #[tokio::test]
    async fn metrics_are_exposed_as_text() {
        let app = router(state(Arc::new(InMemoryBucketStore::default())));
        app.clone()
            .oneshot(post_check(
                r#"{"requestId":"r1","tenantId":"t1","resourceKey":"/orders"}"#,
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("quotr_checks_total"));
    }
}
