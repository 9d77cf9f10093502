//! Durable, deduplicated record of every quota decision.

pub mod consumer;
pub mod ingestor;
pub mod memory;
pub mod sqlite;

use crate::errors::Result;
use crate::events::QuotaConsumedEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use consumer::AuditConsumer;
pub use ingestor::{AuditIngestor, IngestReport};
pub use memory::MemoryAuditStore;
pub use sqlite::SqliteAuditStore;

/// Audit row as handed to the store; `request_id` is the uniqueness key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditRecord {
    pub request_id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub resource_key: String,
    pub tokens: i64,
    pub tokens_consumed: i64,
    pub allowed: bool,
    pub remaining: i64,
    pub reason: String,
    pub policy_version: Option<String>,
    pub process_path: String,
    pub trace_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub latency_ms: Option<i64>,
    /// Decision time (epoch millis)
    pub timestamp: i64,
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl From<&QuotaConsumedEvent> for NewAuditRecord {
    fn from(event: &QuotaConsumedEvent) -> Self {
        let meta = |key: &str| {
            event
                .metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        Self {
            request_id: event.request_id.clone(),
            event_id: event.event_id.clone(),
            tenant_id: event.tenant_id.clone(),
            resource_key: event.resource_key.clone(),
            tokens: saturating_i64(event.tokens_requested),
            tokens_consumed: saturating_i64(event.tokens_consumed),
            allowed: event.allowed,
            remaining: saturating_i64(event.remaining_tokens),
            reason: event.reason.as_str().to_string(),
            policy_version: event.policy_version.clone(),
            process_path: event.process_path.as_str().to_string(),
            trace_id: event.trace_id.clone(),
            client_ip: meta("clientIp"),
            user_agent: meta("userAgent"),
            latency_ms: event.process_time_ms.map(saturating_i64),
            timestamp: event.timestamp,
        }
    }
}

/// Persisted audit row with its server-assigned identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: i64,
    pub request_id: String,
    pub event_id: String,
    pub tenant_id: String,
    pub resource_key: String,
    pub tokens: i64,
    pub tokens_consumed: i64,
    pub allowed: bool,
    pub remaining: i64,
    pub reason: String,
    pub policy_version: Option<String>,
    pub process_path: String,
    pub trace_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub latency_ms: Option<i64>,
    pub timestamp: i64,
    /// Insertion time (epoch millis)
    pub created_at: i64,
}

/// Durable-insert contract of the audit store.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Which of `request_ids` already have a row.
    async fn existing_request_ids(&self, request_ids: &[String]) -> Result<HashSet<String>>;

    /// Insert all records or none of them.
    async fn insert_batch(&self, records: &[NewAuditRecord]) -> Result<()>;

    /// Insert one record; an existing row for the same request id is
    /// reported as `QuotaError::DuplicateRecord`.
    async fn insert_one(&self, record: &NewAuditRecord) -> Result<()>;

    async fn count(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckRequest, CheckResponse, ProcessPath, Reason};

    #[test]
    fn projects_event_fields_and_metadata() {
        let mut request = CheckRequest::new("req-1", "t1", "/orders", 4);
        let mut metadata = crate::check::Metadata::new();
        metadata.insert("clientIp".into(), "10.0.0.7".into());
        metadata.insert("userAgent".into(), "curl/8".into());
        request.metadata = Some(metadata);

        let response = CheckResponse {
            allowed: false,
            remaining: 2,
            policy_version: Some("v3".into()),
            reason: Reason::QuotaExceeded,
            tenant_id: "t1".into(),
            resource_key: "/orders".into(),
            request_id: "req-1".into(),
            timestamp: 1_700_000_000_000,
        };
        let event = QuotaConsumedEvent::from_decision(
            &request,
            &response,
            ProcessPath::Distributed,
            None,
            Some(12),
        );

        let record = NewAuditRecord::from(&event);
        assert_eq!(record.request_id, "req-1");
        assert_eq!(record.tokens, 4);
        assert_eq!(record.tokens_consumed, 0);
        assert_eq!(record.reason, "quota_exceeded");
        assert_eq!(record.process_path, "distributed");
        assert_eq!(record.client_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(record.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(record.latency_ms, Some(12));
    }
}
