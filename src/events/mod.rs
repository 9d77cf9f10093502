//! Decision events and the fire-and-forget publishers that emit them.

pub mod kafka;
pub mod partition;

use crate::check::{CheckRequest, CheckResponse, Metadata, ProcessPath, Reason};
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use kafka::KafkaEventPublisher;
pub use partition::{PartitionKeySelector, PartitionStrategy};

/// One per check decision. `event_id` is unique per emission; `request_id`
/// identifies the business request and is what the audit side deduplicates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConsumedEvent {
    pub event_id: String,
    pub request_id: String,
    pub tenant_id: String,
    pub resource_key: String,
    pub tokens_requested: u64,
    pub tokens_consumed: u64,
    pub allowed: bool,
    pub reason: Reason,
    #[serde(default)]
    pub policy_version: Option<String>,
    pub remaining_tokens: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub process_path: ProcessPath,
    #[serde(default)]
    pub process_time_ms: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl QuotaConsumedEvent {
    pub fn from_decision(
        request: &CheckRequest,
        response: &CheckResponse,
        process_path: ProcessPath,
        trace_id: Option<String>,
        process_time_ms: Option<u64>,
    ) -> Self {
        let tokens_requested = request.tokens_requested();
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            request_id: response.request_id.clone(),
            tenant_id: response.tenant_id.clone(),
            resource_key: response.resource_key.clone(),
            tokens_requested,
            tokens_consumed: if response.allowed { tokens_requested } else { 0 },
            allowed: response.allowed,
            reason: response.reason,
            policy_version: response.policy_version.clone(),
            remaining_tokens: response.remaining,
            timestamp: response.timestamp,
            trace_id,
            process_path,
            process_time_ms,
            metadata: request.metadata.clone(),
        }
    }
}

/// Asynchronous, best-effort event emission.
///
/// `publish` must return without waiting on the broker. An `Err` means the
/// event could not even be handed off; delivery failures after hand-off are
/// counted and logged by the implementation.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: QuotaConsumedEvent) -> Result<()>;
}

/// Publisher used when no event stream is configured: events go to the log.
#[derive(Debug, Default)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, event: QuotaConsumedEvent) -> Result<()> {
        debug!(
            event_id = %event.event_id,
            request_id = %event.request_id,
            tenant_id = %event.tenant_id,
            resource_key = %event.resource_key,
            allowed = event.allowed,
            reason = event.reason.as_str(),
            path = event.process_path.as_str(),
            "Quota event (no stream configured)"
        );
        Ok(())
    }
}
